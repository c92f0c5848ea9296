//! The operation client.
//!
//! [`OperationClient`] is the seam between the reconciliation engine and the
//! control plane. Orchestrators receive a client as an argument; production
//! code uses [`HttpOperationClient`], tests use
//! [`ScriptedClient`](crate::testing::ScriptedClient).

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::config::ClientConfig;
use crate::error::{OperationError, ReconcileError};
use crate::query::path_str;
use crate::types::{Method, OperationRequest};

/// Paths searched for a vendor error code, in order.
const ERROR_CODE_PATHS: &[&str] = &["error_code", "errCode", "error.code", "code"];

/// Paths searched for a vendor error message, in order.
const ERROR_MESSAGE_PATHS: &[&str] = &[
    "error_msg",
    "externalMessage",
    "errMsg",
    "error.message",
    "message",
];

/// Issues control-plane requests.
///
/// Implementations return the decoded JSON body on success. Failures keep the
/// status and raw body so that callers can classify them.
#[async_trait]
pub trait OperationClient: Send + Sync {
    /// Send one request.
    async fn request(&self, request: &OperationRequest) -> Result<Value, OperationError>;
}

#[async_trait]
impl<C: OperationClient + ?Sized> OperationClient for &C {
    async fn request(&self, request: &OperationRequest) -> Result<Value, OperationError> {
        (**self).request(request).await
    }
}

#[async_trait]
impl<C: OperationClient + ?Sized> OperationClient for Arc<C> {
    async fn request(&self, request: &OperationRequest) -> Result<Value, OperationError> {
        (**self).request(request).await
    }
}

#[async_trait]
impl<C: OperationClient + ?Sized> OperationClient for Box<C> {
    async fn request(&self, request: &OperationRequest) -> Result<Value, OperationError> {
        (**self).request(request).await
    }
}

/// An [`OperationClient`] speaking JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpOperationClient {
    http: reqwest::Client,
    config: ClientConfig,
}

impl HttpOperationClient {
    /// Build a client from a validated config.
    pub fn new(config: ClientConfig) -> Result<Self, ReconcileError> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                ReconcileError::Configuration(format!("invalid header name '{}': {}", name, e))
            })?;
            let value = HeaderValue::from_str(value).map_err(|e| {
                ReconcileError::Configuration(format!("invalid value for header '{}': {}", name, e))
            })?;
            headers.insert(name, value);
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .default_headers(headers)
            .build()
            .map_err(|e| ReconcileError::Configuration(e.to_string()))?;

        Ok(Self { http, config })
    }

    /// The config this client was built from.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Absolute URL of a request. `{project_id}` defaults to the configured
    /// project.
    pub fn url(&self, request: &OperationRequest) -> Result<String, OperationError> {
        let path = if request.path_params.contains_key("project_id") {
            request.render_path()?
        } else {
            request
                .clone()
                .with_path_param("project_id", self.config.project_id.as_str())
                .render_path()?
        };
        Ok(format!(
            "{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            path.trim_start_matches('/')
        ))
    }
}

#[async_trait]
impl OperationClient for HttpOperationClient {
    #[instrument(skip_all, fields(request = %request))]
    async fn request(&self, request: &OperationRequest) -> Result<Value, OperationError> {
        let url = self.url(request)?;
        debug!(%url, "Sending request");

        let mut builder = self.http.request(to_reqwest(request.method), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| OperationError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| OperationError::Transport(e.to_string()))?;
        debug!(status, "Received response");

        decode_response(request, status, &text)
    }
}

fn to_reqwest(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

/// Turn an HTTP status and body into the client's result.
///
/// Expected statuses decode the body as JSON (an empty body is `null`). Other
/// statuses become [`OperationError::ServiceResponse`] when a vendor error
/// code can be found in the body, [`OperationError::UnexpectedStatus`]
/// otherwise.
pub fn decode_response(
    request: &OperationRequest,
    status: u16,
    body: &str,
) -> Result<Value, OperationError> {
    if request.is_expected_status(status) {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(body).map_err(|e| {
            OperationError::InvalidResponse(format!("invalid JSON in {} response: {}", request, e))
        });
    }

    let tree = match serde_json::from_str::<Value>(body) {
        Ok(tree) => tree,
        Err(_) => {
            return Err(OperationError::UnexpectedStatus {
                status,
                body: body.to_string(),
            })
        },
    };

    let code = ERROR_CODE_PATHS.iter().find_map(|path| path_str(path, &tree));
    match code {
        Some(code) => {
            let message = ERROR_MESSAGE_PATHS
                .iter()
                .find_map(|path| path_str(path, &tree))
                .unwrap_or_default();
            Err(OperationError::ServiceResponse {
                status,
                code,
                message,
                body: body.to_string(),
            })
        },
        None => Err(OperationError::UnexpectedStatus {
            status,
            body: body.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{classify, ClassificationRule};
    use serde_json::json;

    fn show_cluster() -> OperationRequest {
        OperationRequest::get("v1.0/{project_id}/clusters/{cluster_id}")
            .with_path_param("cluster_id", "c-1")
    }

    #[test]
    fn test_decode_success() {
        let value = decode_response(&show_cluster(), 200, r#"{"cluster":{"status":"200"}}"#)
            .unwrap();
        assert_eq!(value["cluster"]["status"], "200");
        assert_eq!(decode_response(&show_cluster(), 204, "").unwrap(), Value::Null);
    }

    #[test]
    fn test_decode_invalid_success_body() {
        let err = decode_response(&show_cluster(), 200, "<html>").unwrap_err();
        assert!(matches!(err, OperationError::InvalidResponse(_)));
    }

    #[test]
    fn test_decode_vendor_error() {
        let body = r#"{"errCode":"CSS.0015","externalMessage":"cluster does not exist"}"#;
        match decode_response(&show_cluster(), 403, body).unwrap_err() {
            OperationError::ServiceResponse {
                status,
                code,
                message,
                body: raw,
            } => {
                assert_eq!(status, 403);
                assert_eq!(code, "CSS.0015");
                assert_eq!(message, "cluster does not exist");
                assert_eq!(raw, body);
            },
            other => panic!("unexpected error: {}", other),
        }

        let body = r#"{"error":{"code":"APIGW.0101","message":"not found"}}"#;
        let err = decode_response(&show_cluster(), 404, body).unwrap_err();
        assert!(matches!(err, OperationError::ServiceResponse { ref code, .. } if code == "APIGW.0101"));
    }

    #[test]
    fn test_decode_unexpected_status() {
        let err = decode_response(&show_cluster(), 502, "bad gateway").unwrap_err();
        assert_eq!(
            err,
            OperationError::UnexpectedStatus {
                status: 502,
                body: "bad gateway".to_string()
            }
        );

        let err = decode_response(&show_cluster(), 500, r#"{"detail":"boom"}"#).unwrap_err();
        assert!(matches!(err, OperationError::UnexpectedStatus { status: 500, .. }));
    }

    #[test]
    fn test_ok_codes_override_default() {
        let request = show_cluster().with_ok_codes([200]);
        assert!(decode_response(&request, 202, "{}").is_err());
    }

    #[test]
    fn test_decoded_errors_classify() {
        let rules = [ClassificationRule::new(403, "errCode", "CSS.0015")];
        let err = decode_response(&show_cluster(), 403, r#"{"errCode":"CSS.0015"}"#).unwrap_err();
        assert!(classify(err, &rules).is_not_found());
    }

    #[test]
    fn test_decoded_code_does_not_leak_into_other_paths() {
        let body = r#"{"error_code":"CSS.0015","error_msg":"other"}"#;
        let err = decode_response(&show_cluster(), 403, body).unwrap_err();
        assert!(matches!(err, OperationError::ServiceResponse { ref code, .. } if code == "CSS.0015"));

        let by_errcode = [ClassificationRule::new(403, "errCode", "CSS.0015")];
        assert_eq!(classify(err.clone(), &by_errcode), err);

        let by_error_code = [ClassificationRule::new(403, "error_code", "CSS.0015")];
        assert!(classify(err, &by_error_code).is_not_found());
    }

    #[test]
    fn test_url_fills_project_id() {
        let client = HttpOperationClient::new(ClientConfig::new("https://css.example.com/", "p-1"))
            .unwrap();
        assert_eq!(
            client.url(&show_cluster()).unwrap(),
            "https://css.example.com/v1.0/p-1/clusters/c-1"
        );

        let explicit = show_cluster().with_path_param("project_id", "p-2");
        assert_eq!(
            client.url(&explicit).unwrap(),
            "https://css.example.com/v1.0/p-2/clusters/c-1"
        );

        let missing = OperationRequest::get("v1.0/{project_id}/clusters/{cluster_id}");
        assert!(matches!(
            client.url(&missing),
            Err(OperationError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let config = ClientConfig::new("https://css.example.com", "p-1")
            .with_header("bad header", "x");
        assert!(matches!(
            HttpOperationClient::new(config),
            Err(ReconcileError::Configuration(_))
        ));
    }

    /// Serve one canned HTTP response and return the request head received.
    async fn serve_once(
        status_line: &'static str,
        body: &'static str,
    ) -> (String, tokio::task::JoinHandle<String>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
            }
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).into_owned()
        });
        (endpoint, server)
    }

    #[tokio::test]
    async fn test_http_request_sends_query_and_headers() {
        let (endpoint, server) = serve_once("200 OK", r#"{"status":"200"}"#).await;
        let client = HttpOperationClient::new(
            ClientConfig::new(endpoint, "p-1").with_header("x-language", "en-us"),
        )
        .unwrap();

        let value = client
            .request(&show_cluster().with_query("detail", "true"))
            .await
            .unwrap();
        assert_eq!(value["status"], "200");

        let head = server.await.unwrap().to_lowercase();
        assert!(head.starts_with("get /v1.0/p-1/clusters/c-1?detail=true http/1.1"));
        assert!(head.contains("x-language: en-us"));
    }

    #[tokio::test]
    async fn test_http_error_response_is_decoded() {
        let (endpoint, server) = serve_once(
            "403 Forbidden",
            r#"{"errCode":"CSS.0015","externalMessage":"cluster does not exist"}"#,
        )
        .await;
        let client = HttpOperationClient::new(ClientConfig::new(endpoint, "p-1")).unwrap();

        let err = client.request(&show_cluster()).await.unwrap_err();
        assert!(matches!(
            err,
            OperationError::ServiceResponse { status: 403, ref code, .. } if code == "CSS.0015"
        ));
        let rules = [ClassificationRule::new(403, "errCode", "CSS.0015")];
        assert!(classify(err, &rules).is_not_found());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_client_by_reference_and_arc() {
        use crate::testing::ScriptedClient;

        let client = ScriptedClient::new();
        client.respond_ok(
            Method::Get,
            "v1.0/p-1/clusters/c-1",
            json!({"cluster": {"status": "200"}}),
        );
        client.respond_ok(
            Method::Get,
            "v1.0/p-1/clusters/c-1",
            json!({"cluster": {"status": "100"}}),
        );
        let request = show_cluster().with_path_param("project_id", "p-1");

        let by_ref = (&client).request(&request).await.unwrap();
        assert_eq!(by_ref["cluster"]["status"], "200");

        let shared = Arc::new(client);
        let by_arc = shared.request(&request).await.unwrap();
        assert_eq!(by_arc["cluster"]["status"], "100");
    }
}
