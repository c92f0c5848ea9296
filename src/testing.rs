//! Testing utilities for orchestrators and refresh functions.
//!
//! [`ScriptedClient`] stands in for the control plane: responses are queued
//! per method and rendered path, and every call is recorded. Combined with
//! `#[tokio::test(start_paused = true)]`, whole lifecycles (including hour
//! long timeouts) run instantly.
//!
//! # Example
//!
//! ```ignore
//! use hemmer_reconcile::testing::ScriptedClient;
//! use hemmer_reconcile::Method;
//! use serde_json::json;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_create_cluster() {
//!     let client = ScriptedClient::new();
//!     client.respond_ok(Method::Post, "v1.0/project-1/clusters", json!({"cluster": {"id": "c-1"}}));
//!     client.respond_ok(Method::Get, "v1.0/project-1/clusters/c-1", json!({"status": "200"}));
//!
//!     let orchestrator = ClusterOrchestrator::new(&client);
//!     let cluster = orchestrator.create(json!({"cluster": {}})).await.unwrap();
//!     assert_eq!(cluster.id, "c-1");
//! }
//! ```

use std::collections::{HashMap, VecDeque};
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::client::{decode_response, OperationClient};
use crate::error::{OperationError, ReconcileError};
use crate::types::{Method, OperationRequest, PollState};

/// Project id [`ScriptedClient`] substitutes for `{project_id}`.
pub const TEST_PROJECT_ID: &str = "project-1";

type Route = (Method, String);

/// A call received by a [`ScriptedClient`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// HTTP method.
    pub method: Method,
    /// Rendered path.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<Value>,
}

/// An [`OperationClient`] answering from queued responses.
///
/// Responses for a route are returned in the order they were queued. The last
/// response of a route is sticky: it is returned again for every further call,
/// which keeps a polled resource in its final state.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    responses: Mutex<HashMap<Route, VecDeque<Result<Value, OperationError>>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl ScriptedClient {
    /// Create a client with no scripted responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `method path`.
    pub fn respond(
        &self,
        method: Method,
        path: impl Into<String>,
        response: Result<Value, OperationError>,
    ) -> &Self {
        lock(&self.responses)
            .entry((method, path.into()))
            .or_default()
            .push_back(response);
        self
    }

    /// Queue a successful response.
    pub fn respond_ok(&self, method: Method, path: impl Into<String>, body: Value) -> &Self {
        self.respond(method, path, Ok(body))
    }

    /// Queue an error response.
    pub fn respond_err(
        &self,
        method: Method,
        path: impl Into<String>,
        err: OperationError,
    ) -> &Self {
        self.respond(method, path, Err(err))
    }

    /// Queue a raw HTTP answer, decoded the way [`HttpOperationClient`] would.
    ///
    /// [`HttpOperationClient`]: crate::client::HttpOperationClient
    pub fn respond_status(
        &self,
        method: Method,
        path: impl Into<String>,
        status: u16,
        body: &str,
    ) -> &Self {
        let path = path.into();
        let request = OperationRequest::new(method, path.clone());
        self.respond(method, path, decode_response(&request, status, body))
    }

    /// Every call received so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Calls received for `method path`.
    pub fn calls_to(&self, method: Method, path: &str) -> Vec<RecordedCall> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.method == method && call.path == path)
            .cloned()
            .collect()
    }

    /// Number of calls received for `method path`.
    pub fn call_count(&self, method: Method, path: &str) -> usize {
        self.calls_to(method, path).len()
    }
}

#[async_trait]
impl OperationClient for ScriptedClient {
    async fn request(&self, request: &OperationRequest) -> Result<Value, OperationError> {
        let mut request = request.clone();
        if !request.path_params.contains_key("project_id") {
            request = request.with_path_param("project_id", TEST_PROJECT_ID);
        }
        let path = request.render_path()?;

        lock(&self.calls).push(RecordedCall {
            method: request.method,
            path: path.clone(),
            query: request.query.clone(),
            body: request.body.clone(),
        });

        let mut responses = lock(&self.responses);
        let queue = responses
            .get_mut(&(request.method, path.clone()))
            .filter(|queue| !queue.is_empty())
            .ok_or_else(|| {
                OperationError::Transport(format!(
                    "no scripted response for {} {}",
                    request.method, path
                ))
            })?;

        if queue.len() > 1 {
            queue
                .pop_front()
                .ok_or_else(|| OperationError::Transport("empty response queue".to_string()))?
        } else {
            queue
                .front()
                .cloned()
                .ok_or_else(|| OperationError::Transport("empty response queue".to_string()))?
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A refresh function replaying `labels`, one per call.
///
/// Each snapshot is `{"status": <label>, "tick": <call number>}`. The last
/// label repeats once the script is exhausted. The returned counter holds the
/// number of calls made.
pub fn scripted_refresh<I, S>(
    labels: I,
) -> (
    impl FnMut() -> Ready<Result<PollState<Value>, OperationError>>,
    Arc<AtomicUsize>,
)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let refresh = move || {
        let tick = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let label = labels
            .get(tick - 1)
            .or_else(|| labels.last())
            .cloned()
            .unwrap_or_default();
        let snapshot = json!({"status": label.clone(), "tick": tick});
        ready(Ok(PollState::new(label, snapshot)))
    };

    (refresh, calls)
}

// =========================================================================
// Assertion Helpers
// =========================================================================

/// Assert that an error is rooted in "resource absent".
///
/// # Panics
///
/// Panics if the error is anything else.
pub fn assert_not_found(err: &ReconcileError) {
    assert!(
        err.is_not_found(),
        "Expected a not found error, but got: {}",
        err
    );
}

/// Assert that an error is a poller timeout.
///
/// # Panics
///
/// Panics if the error is not [`ReconcileError::Timeout`].
pub fn assert_timeout(err: &ReconcileError) {
    assert!(
        matches!(err, ReconcileError::Timeout { .. }),
        "Expected a timeout, but got: {}",
        err
    );
}

/// Assert that an error is a terminal state failure with the given label.
///
/// # Panics
///
/// Panics if the error is not [`ReconcileError::TerminalState`] or the label
/// differs.
pub fn assert_terminal_state(err: &ReconcileError, expected_label: &str) {
    match err {
        ReconcileError::TerminalState { label, .. } => assert_eq!(
            label, expected_label,
            "Expected terminal state '{}', but got '{}'",
            expected_label, label
        ),
        other => panic!(
            "Expected terminal state '{}', but got: {}",
            expected_label, other
        ),
    }
}

/// Assert that an error is an ambiguous lookup with `matched` candidates.
///
/// # Panics
///
/// Panics if the error is not [`ReconcileError::AmbiguousLookup`] or the
/// count differs.
pub fn assert_ambiguous(err: &ReconcileError, expected_matches: usize) {
    match err {
        ReconcileError::AmbiguousLookup { matched, .. } => assert_eq!(
            *matched, expected_matches,
            "Expected {} matching candidates, but got {}",
            expected_matches, matched
        ),
        other => panic!("Expected an ambiguous lookup, but got: {}", other),
    }
}
