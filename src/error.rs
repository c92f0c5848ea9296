//! Error types for the reconciliation engine.
//!
//! Two layers of errors exist:
//!
//! - [`OperationError`] is what a single control-plane call produces. It keeps
//!   the HTTP status and vendor body around so the classifier can pattern-match
//!   on them.
//! - [`ReconcileError`] is what an orchestrated lifecycle transition produces.
//!   It wraps operation errors with resource and operation context and adds the
//!   poller's own exit reasons (terminal state, timeout, cancellation).

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a single control-plane operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    /// The request never produced an HTTP response.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The service answered with a status outside the expected set and no
    /// vendor error code could be decoded from the body.
    #[error("Unexpected status {status}: {body}")]
    UnexpectedStatus {
        /// HTTP status code.
        status: u16,
        /// Raw response body.
        body: String,
    },

    /// The service answered with a structured vendor error.
    #[error("Service error {code} (status {status}): {message}")]
    ServiceResponse {
        /// HTTP status code.
        status: u16,
        /// Vendor error code, e.g. `CSS.0015`.
        code: String,
        /// Vendor error message.
        message: String,
        /// Raw response body.
        body: String,
    },

    /// The resource does not exist. This is the canonical absence signal the
    /// classifier rewrites vendor errors into.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The request could not be built (e.g. an unresolved path placeholder).
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A successful response did not have the expected shape.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl OperationError {
    /// Get the error message as a string.
    pub fn message(&self) -> &str {
        match self {
            Self::Transport(msg) => msg,
            Self::UnexpectedStatus { body, .. } => body,
            Self::ServiceResponse { message, .. } => message,
            Self::NotFound(msg) => msg,
            Self::InvalidRequest(msg) => msg,
            Self::InvalidResponse(msg) => msg,
        }
    }

    /// The HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::UnexpectedStatus { status, .. } | Self::ServiceResponse { status, .. } => {
                Some(*status)
            },
            _ => None,
        }
    }

    /// The raw response body carried by the error, if any.
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::UnexpectedStatus { body, .. } | Self::ServiceResponse { body, .. } => Some(body),
            _ => None,
        }
    }

    /// Whether this is the canonical "resource absent" error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors produced while reconciling a remote resource.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A submit or read call failed.
    #[error("{operation} failed for {resource}: {source}")]
    Operation {
        /// Resource identity, e.g. `css cluster c-123`.
        resource: String,
        /// Operation name, e.g. `extend cluster`.
        operation: String,
        /// Underlying operation error.
        #[source]
        source: OperationError,
    },

    /// The refresh function returned an error while polling.
    #[error("error refreshing {resource} after {elapsed:?}: {source}")]
    Refresh {
        /// Resource identity.
        resource: String,
        /// Time spent polling before the error.
        elapsed: Duration,
        /// Underlying operation error.
        #[source]
        source: OperationError,
    },

    /// The remote resource reported a state outside the pending and target
    /// sets.
    #[error("{resource} reached unexpected state '{label}' (expected one of {expected:?})")]
    TerminalState {
        /// Resource identity.
        resource: String,
        /// The observed label.
        label: String,
        /// The target labels the poller was waiting for.
        expected: Vec<String>,
        /// Last observed snapshot.
        snapshot: Option<serde_json::Value>,
    },

    /// The poller ran out of time while the resource was still pending.
    #[error("timeout after {elapsed:?} waiting for {resource} (last state: {})", .last_label.as_deref().unwrap_or("none"))]
    Timeout {
        /// Resource identity.
        resource: String,
        /// Time spent polling.
        elapsed: Duration,
        /// Last observed label, if any refresh completed.
        last_label: Option<String>,
        /// Last observed snapshot.
        snapshot: Option<serde_json::Value>,
    },

    /// The caller cancelled the operation.
    #[error("waiting for {resource} cancelled after {elapsed:?}")]
    Cancelled {
        /// Resource identity.
        resource: String,
        /// Time spent before cancellation.
        elapsed: Duration,
    },

    /// A derived-identifier lookup matched zero or several candidates.
    #[error("ambiguous lookup for {resource}: {matched} candidates matched {description}")]
    AmbiguousLookup {
        /// Resource identity.
        resource: String,
        /// What was being looked up.
        description: String,
        /// Number of candidates that matched.
        matched: usize,
    },

    /// A poll spec violates its invariants.
    #[error("Invalid poll spec: {0}")]
    InvalidPollSpec(String),

    /// A response was missing a field the orchestrator relies on.
    #[error("unexpected response from {resource}: {message}")]
    Response {
        /// Resource identity.
        resource: String,
        /// What was wrong with the response.
        message: String,
    },

    /// A configuration value could not be used.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An operation failed and its compensating cleanup failed too.
    #[error("{primary}; cleanup failed: {cleanup}")]
    Compensation {
        /// The error that triggered the cleanup.
        primary: Box<ReconcileError>,
        /// The error raised by the cleanup itself.
        cleanup: Box<ReconcileError>,
    },
}

impl ReconcileError {
    /// Wrap an operation error with resource and operation context.
    pub fn operation(
        resource: impl Into<String>,
        operation: impl Into<String>,
        source: OperationError,
    ) -> Self {
        Self::Operation {
            resource: resource.into(),
            operation: operation.into(),
            source,
        }
    }

    /// Whether this error is rooted in the canonical "resource absent" error.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Operation { source, .. } | Self::Refresh { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// The underlying operation error, if this error wraps one.
    pub fn operation_error(&self) -> Option<&OperationError> {
        match self {
            Self::Operation { source, .. } | Self::Refresh { source, .. } => Some(source),
            _ => None,
        }
    }

    /// The last snapshot observed before the poller gave up, if any.
    pub fn last_snapshot(&self) -> Option<&serde_json::Value> {
        match self {
            Self::TerminalState { snapshot, .. } | Self::Timeout { snapshot, .. } => {
                snapshot.as_ref()
            },
            Self::Compensation { primary, .. } => primary.last_snapshot(),
            _ => None,
        }
    }

    /// Combine this error with the error of a failed cleanup.
    pub fn with_cleanup_failure(self, cleanup: ReconcileError) -> Self {
        Self::Compensation {
            primary: Box::new(self),
            cleanup: Box::new(cleanup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_error_display() {
        let err = OperationError::NotFound("cluster c-1".to_string());
        assert_eq!(format!("{}", err), "Resource not found: cluster c-1");

        let err = OperationError::UnexpectedStatus {
            status: 400,
            body: "{}".to_string(),
        };
        assert_eq!(format!("{}", err), "Unexpected status 400: {}");

        let err = OperationError::ServiceResponse {
            status: 403,
            code: "CSS.0015".to_string(),
            message: "cluster does not exist".to_string(),
            body: String::new(),
        };
        assert_eq!(
            format!("{}", err),
            "Service error CSS.0015 (status 403): cluster does not exist"
        );
    }

    #[test]
    fn test_operation_error_accessors() {
        let err = OperationError::UnexpectedStatus {
            status: 404,
            body: "gone".to_string(),
        };
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.body(), Some("gone"));
        assert_eq!(err.message(), "gone");
        assert!(!err.is_not_found());

        let err = OperationError::Transport("connection reset".to_string());
        assert_eq!(err.status(), None);
        assert_eq!(err.body(), None);
    }

    #[test]
    fn test_reconcile_error_not_found() {
        let err = ReconcileError::operation(
            "css cluster c-1",
            "show cluster",
            OperationError::NotFound("c-1".to_string()),
        );
        assert!(err.is_not_found());
        assert_eq!(
            format!("{}", err),
            "show cluster failed for css cluster c-1: Resource not found: c-1"
        );

        let err = ReconcileError::InvalidPollSpec("empty target".to_string());
        assert!(!err.is_not_found());
        assert!(err.operation_error().is_none());
    }

    #[test]
    fn test_timeout_display_and_snapshot() {
        let err = ReconcileError::Timeout {
            resource: "task t-1".to_string(),
            elapsed: Duration::from_secs(30),
            last_label: Some("RUNNING".to_string()),
            snapshot: Some(serde_json::json!({"status": "RUNNING"})),
        };
        assert_eq!(
            format!("{}", err),
            "timeout after 30s waiting for task t-1 (last state: RUNNING)"
        );
        assert_eq!(err.last_snapshot().unwrap()["status"], "RUNNING");
    }

    #[test]
    fn test_compensation_reports_both_errors() {
        let primary = ReconcileError::operation(
            "batch task",
            "create batch task",
            OperationError::Transport("reset".to_string()),
        );
        let cleanup = ReconcileError::operation(
            "batch task file f-1",
            "delete batch task file",
            OperationError::Transport("refused".to_string()),
        );
        let err = primary.with_cleanup_failure(cleanup);
        let text = format!("{}", err);
        assert!(text.contains("create batch task failed"));
        assert!(text.contains("cleanup failed: delete batch task file failed"));
    }
}
