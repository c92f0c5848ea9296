//! Client and timeout configuration.
//!
//! Provider configuration arrives as a JSON value (the same shape the
//! provider's `configure` block produces). Resource timeouts use Terraform
//! duration strings such as `"60m"` or `"1h30m"`.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ReconcileError;

/// Wait before the first poll of a remote state.
pub const DEFAULT_POLL_DELAY: Duration = Duration::from_secs(10);

/// Wait between two polls of a remote state.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default create, update and delete timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Connection settings for [`HttpOperationClient`](crate::client::HttpOperationClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Service endpoint, e.g. `https://css.eu-west-0.example.com`.
    pub endpoint: String,
    /// Project id substituted for `{project_id}` in request paths.
    pub project_id: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Headers sent with every request (e.g. an auth token).
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

impl ClientConfig {
    /// Create a config with default timeouts and no extra headers.
    pub fn new(endpoint: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            project_id: project_id.into(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            headers: BTreeMap::new(),
        }
    }

    /// Deserialize and validate a config from a JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ReconcileError> {
        let config: Self = serde_json::from_value(value)
            .map_err(|e| ReconcileError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the config can be used to build a client.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.endpoint.trim().is_empty() {
            return Err(ReconcileError::Configuration(
                "endpoint must not be empty".to_string(),
            ));
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(ReconcileError::Configuration(format!(
                "endpoint '{}' must start with http:// or https://",
                self.endpoint
            )));
        }
        if self.project_id.trim().is_empty() {
            return Err(ReconcileError::Configuration(
                "project_id must not be empty".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(ReconcileError::Configuration(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_secs = timeout.as_secs();
        self
    }

    /// Add a header sent with every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Per-resource operation timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTimeouts {
    /// Timeout for create operations.
    pub create: Duration,
    /// Timeout for update operations.
    pub update: Duration,
    /// Timeout for delete operations.
    pub delete: Duration,
}

impl Default for ResourceTimeouts {
    fn default() -> Self {
        Self {
            create: DEFAULT_TIMEOUT,
            update: DEFAULT_TIMEOUT,
            delete: DEFAULT_TIMEOUT,
        }
    }
}

impl ResourceTimeouts {
    /// Use the same timeout for every operation.
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            create: timeout,
            update: timeout,
            delete: timeout,
        }
    }

    /// Read a `timeouts` block, e.g. `{"create": "30m", "delete": "1h"}`.
    ///
    /// Missing keys keep the default. `null` yields all defaults.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, ReconcileError> {
        let mut timeouts = Self::default();
        if value.is_null() {
            return Ok(timeouts);
        }
        let object = value.as_object().ok_or_else(|| {
            ReconcileError::Configuration("timeouts must be an object".to_string())
        })?;

        for (key, raw) in object {
            let text = raw.as_str().ok_or_else(|| {
                ReconcileError::Configuration(format!("timeout '{}' must be a string", key))
            })?;
            let parsed = parse_duration(text)?;
            match key.as_str() {
                "create" => timeouts.create = parsed,
                "update" => timeouts.update = parsed,
                "delete" => timeouts.delete = parsed,
                other => {
                    return Err(ReconcileError::Configuration(format!(
                        "unknown timeout '{}'",
                        other
                    )))
                },
            }
        }

        Ok(timeouts)
    }

    /// Set the create timeout.
    pub fn with_create(mut self, timeout: Duration) -> Self {
        self.create = timeout;
        self
    }

    /// Set the update timeout.
    pub fn with_update(mut self, timeout: Duration) -> Self {
        self.update = timeout;
        self
    }

    /// Set the delete timeout.
    pub fn with_delete(mut self, timeout: Duration) -> Self {
        self.delete = timeout;
        self
    }
}

/// Parse a Terraform duration string such as `"45s"`, `"60m"` or `"1h30m"`.
///
/// Units are `h`, `m`, `s` and `ms`. A bare number is rejected.
pub fn parse_duration(text: &str) -> Result<Duration, ReconcileError> {
    let invalid = |reason: &str| {
        ReconcileError::Configuration(format!("invalid duration '{}': {}", text, reason))
    };

    let input = text.trim();
    if input.is_empty() {
        return Err(invalid("empty"));
    }

    let mut total = Duration::ZERO;
    let mut chars = input.chars().peekable();
    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_digit()) {
            digits.push(c);
            chars.next();
        }
        if digits.is_empty() {
            return Err(invalid("expected a number"));
        }
        let amount: u64 = digits.parse().map_err(|_| invalid("number out of range"))?;

        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_alphabetic()) {
            unit.push(c);
            chars.next();
        }
        let part = match unit.as_str() {
            "h" => Duration::from_secs(amount.saturating_mul(3600)),
            "m" => Duration::from_secs(amount.saturating_mul(60)),
            "s" => Duration::from_secs(amount),
            "ms" => Duration::from_millis(amount),
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };
        total = total.saturating_add(part);
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("60m").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration(" 2h ").unwrap(), Duration::from_secs(7200));
    }

    #[test]
    fn test_parse_duration_invalid() {
        for input in ["", "10", "m", "10d", "1h-5m", "abc"] {
            assert!(
                matches!(parse_duration(input), Err(ReconcileError::Configuration(_))),
                "expected '{}' to be rejected",
                input
            );
        }
    }

    #[test]
    fn test_resource_timeouts_defaults() {
        let timeouts = ResourceTimeouts::default();
        assert_eq!(timeouts.create, Duration::from_secs(3600));
        assert_eq!(timeouts.update, Duration::from_secs(3600));
        assert_eq!(timeouts.delete, Duration::from_secs(3600));
        assert_eq!(
            ResourceTimeouts::from_value(&serde_json::Value::Null).unwrap(),
            timeouts
        );
    }

    #[test]
    fn test_resource_timeouts_from_value() {
        let timeouts =
            ResourceTimeouts::from_value(&json!({"create": "30m", "delete": "1h30m"})).unwrap();
        assert_eq!(timeouts.create, Duration::from_secs(1800));
        assert_eq!(timeouts.update, DEFAULT_TIMEOUT);
        assert_eq!(timeouts.delete, Duration::from_secs(5400));

        assert!(ResourceTimeouts::from_value(&json!({"read": "5m"})).is_err());
        assert!(ResourceTimeouts::from_value(&json!({"create": 30})).is_err());
        assert!(ResourceTimeouts::from_value(&json!("30m")).is_err());
    }

    #[test]
    fn test_client_config_from_value() {
        let config = ClientConfig::from_value(json!({
            "endpoint": "https://css.example.com",
            "project_id": "p-1",
            "headers": {"X-Auth-Token": "secret"}
        }))
        .unwrap();
        assert_eq!(config.project_id, "p-1");
        assert_eq!(config.request_timeout(), Duration::from_secs(60));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.headers.get("X-Auth-Token").unwrap(), "secret");
    }

    #[test]
    fn test_client_config_validation() {
        assert!(ClientConfig::from_value(json!({"endpoint": "https://x"})).is_err());
        assert!(ClientConfig::from_value(json!({
            "endpoint": "ftp://x",
            "project_id": "p"
        }))
        .is_err());
        assert!(ClientConfig::new("https://x", "").validate().is_err());
        assert!(ClientConfig::new("https://x", "p")
            .with_header("X-Language", "en-us")
            .with_request_timeout(Duration::from_secs(5))
            .validate()
            .is_ok());
    }
}
