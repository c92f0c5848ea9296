//! Request and state types shared by the client, poller and orchestrators.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::OperationError;

/// HTTP method of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
    /// `PUT`
    Put,
    /// `PATCH`
    Patch,
    /// `DELETE`
    Delete,
}

impl Method {
    /// The method name as sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single control-plane call.
///
/// The path is a template such as `v1.0/{project_id}/clusters/{cluster_id}`;
/// placeholders are filled from `path_params` when the request is rendered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// HTTP method.
    pub method: Method,
    /// Path template relative to the service endpoint.
    pub path_template: String,
    /// Values for the `{placeholder}`s in the template.
    #[serde(default)]
    pub path_params: BTreeMap<String, String>,
    /// Query string parameters, in order.
    #[serde(default)]
    pub query: Vec<(String, String)>,
    /// JSON request body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Status codes treated as success. Empty means any 2xx.
    #[serde(default)]
    pub ok_codes: Vec<u16>,
}

impl OperationRequest {
    /// Create a request with no parameters or body.
    pub fn new(method: Method, path_template: impl Into<String>) -> Self {
        Self {
            method,
            path_template: path_template.into(),
            path_params: BTreeMap::new(),
            query: Vec::new(),
            body: None,
            ok_codes: Vec::new(),
        }
    }

    /// Create a `GET` request.
    pub fn get(path_template: impl Into<String>) -> Self {
        Self::new(Method::Get, path_template)
    }

    /// Create a `POST` request.
    pub fn post(path_template: impl Into<String>) -> Self {
        Self::new(Method::Post, path_template)
    }

    /// Create a `PUT` request.
    pub fn put(path_template: impl Into<String>) -> Self {
        Self::new(Method::Put, path_template)
    }

    /// Create a `DELETE` request.
    pub fn delete(path_template: impl Into<String>) -> Self {
        Self::new(Method::Delete, path_template)
    }

    /// Set a path placeholder value.
    pub fn with_path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    /// Append a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Set the JSON body.
    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Restrict the status codes treated as success.
    pub fn with_ok_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.ok_codes = codes.into_iter().collect();
        self
    }

    /// Whether `status` counts as success for this request.
    pub fn is_expected_status(&self, status: u16) -> bool {
        if self.ok_codes.is_empty() {
            (200..300).contains(&status)
        } else {
            self.ok_codes.contains(&status)
        }
    }

    /// Render the path template, filling every placeholder.
    pub fn render_path(&self) -> Result<String, OperationError> {
        let mut rendered = String::with_capacity(self.path_template.len());
        let mut rest = self.path_template.as_str();

        while let Some(open) = rest.find('{') {
            rendered.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                OperationError::InvalidRequest(format!(
                    "unterminated placeholder in path '{}'",
                    self.path_template
                ))
            })?;
            let name = &after[..close];
            let value = self.path_params.get(name).ok_or_else(|| {
                OperationError::InvalidRequest(format!(
                    "missing value for placeholder '{{{}}}' in path '{}'",
                    name, self.path_template
                ))
            })?;
            rendered.push_str(value);
            rest = &after[close + 1..];
        }
        rendered.push_str(rest);

        Ok(rendered)
    }
}

impl fmt::Display for OperationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path_template)
    }
}

/// One observation produced by a refresh function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollState<T> {
    /// The state label, compared against the poll spec's pending and target sets.
    pub label: String,
    /// The observed resource, if the refresh produced one.
    pub snapshot: Option<T>,
}

impl<T> PollState<T> {
    /// Create a state with a snapshot.
    pub fn new(label: impl Into<String>, snapshot: T) -> Self {
        Self {
            label: label.into(),
            snapshot: Some(snapshot),
        }
    }

    /// Create a state with no snapshot (e.g. the resource is gone).
    pub fn without_snapshot(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            snapshot: None,
        }
    }
}
