//! The orchestration template.
//!
//! Every asynchronous lifecycle transition follows the same steps: wait for
//! a precondition, submit the mutation, identify what to watch, poll it, then
//! run follow-up or rollback actions. [`Orchestrator`] provides each step for
//! one resource; the modules under [`crate::resources`] compose them.

use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::classify::{check_deleted, classify_result, ClassificationRule};
use crate::client::OperationClient;
use crate::error::{OperationError, ReconcileError};
use crate::poller::{PollSpec, StatePoller};
use crate::query::{path_search, path_str};
use crate::types::{OperationRequest, PollState};

/// Label reported while a deleted resource is still readable.
pub const PRESENT: &str = "PRESENT";

/// Label reported once a resource reads as absent.
pub const DELETED: &str = "DELETED";

/// Items requested per page by [`list_all`].
pub const DEFAULT_PAGE_LIMIT: usize = 10;

/// Paths searched for the total item count of a paged list, in order.
const TOTAL_COUNT_PATHS: &[&str] = &["total_num", "totalSize", "total"];

/// A spec for [`Orchestrator::wait_for_deletion`].
pub fn deletion_spec(timeout: Duration) -> PollSpec {
    PollSpec::new([PRESENT], [DELETED]).with_timeout(timeout)
}

/// Steps of the orchestration template, bound to one client and resource.
#[derive(Debug, Clone)]
pub struct Orchestrator<C> {
    client: C,
    resource: String,
    cancellation: CancellationToken,
}

impl<C: OperationClient> Orchestrator<C> {
    /// Create an orchestrator for `resource` (used in logs and errors).
    pub fn new(client: C, resource: impl Into<String>) -> Self {
        Self {
            client,
            resource: resource.into(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Abort every wait when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// The underlying client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// The resource identity.
    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// Run the state poller with this orchestrator's cancellation token.
    pub async fn wait<T, F, Fut>(
        &self,
        spec: PollSpec,
        refresh: F,
    ) -> Result<PollState<T>, ReconcileError>
    where
        T: Serialize,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollState<T>, OperationError>>,
    {
        StatePoller::new(self.resource.as_str(), spec)
            .with_cancellation(self.cancellation.clone())
            .poll(refresh)
            .await
    }

    /// Wait for a precondition (e.g. "cluster is idle") before submitting.
    pub async fn await_ready<T, F, Fut>(
        &self,
        spec: PollSpec,
        refresh: F,
    ) -> Result<PollState<T>, ReconcileError>
    where
        T: Serialize,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollState<T>, OperationError>>,
    {
        debug!(resource = %self.resource, "Waiting for precondition");
        self.wait(spec, refresh).await
    }

    /// Send a mutating request.
    #[instrument(skip_all, fields(resource = %self.resource, operation = %operation))]
    pub async fn submit(
        &self,
        operation: &str,
        request: &OperationRequest,
    ) -> Result<Value, ReconcileError> {
        self.submit_classified(operation, request, &[]).await
    }

    /// Send a request, classifying its error with `rules`.
    pub async fn submit_classified(
        &self,
        operation: &str,
        request: &OperationRequest,
        rules: &[ClassificationRule],
    ) -> Result<Value, ReconcileError> {
        debug!(resource = %self.resource, %request, "Submitting {}", operation);
        classify_result(self.client.request(request).await, rules)
            .map_err(|source| ReconcileError::operation(self.resource.as_str(), operation, source))
    }

    /// Read a resource, mapping absence to `None`.
    pub async fn read(
        &self,
        operation: &str,
        request: &OperationRequest,
        rules: &[ClassificationRule],
    ) -> Result<Option<Value>, ReconcileError> {
        check_deleted(self.submit_classified(operation, request, rules).await)
    }

    /// Submit, and while the service rejects the request as busy, wait for
    /// `ready` and resubmit.
    ///
    /// `busy` rules recognise the "resource busy" rejection. Every resubmission
    /// waits at least one poll interval, and the whole call is bounded by
    /// `ready_spec.timeout`.
    pub async fn submit_when_ready<T, F, Fut>(
        &self,
        operation: &str,
        request: &OperationRequest,
        busy: &[ClassificationRule],
        ready_spec: PollSpec,
        mut ready: F,
    ) -> Result<Value, ReconcileError>
    where
        T: Serialize,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollState<T>, OperationError>>,
    {
        let start = Instant::now();
        let budget = ready_spec.timeout;
        let delay = ready_spec.delay.max(ready_spec.interval);

        loop {
            let err = match self.client.request(request).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !busy.iter().any(|rule| rule.matches(&err)) {
                return Err(ReconcileError::operation(
                    self.resource.as_str(),
                    operation,
                    err,
                ));
            }

            let remaining = budget.saturating_sub(start.elapsed());
            if remaining <= delay {
                warn!(resource = %self.resource, error = %err, "Resource still busy");
                return Err(ReconcileError::operation(
                    self.resource.as_str(),
                    operation,
                    err,
                ));
            }

            info!(resource = %self.resource, error = %err, "Resource busy, waiting before resubmitting {}", operation);
            let spec = ready_spec.clone().with_timeout(remaining).with_delay(delay);
            self.wait(spec, &mut ready).await?;
        }
    }

    /// Read an identifier out of a submission response.
    pub fn extract_id(&self, response: &Value, path: &str) -> Result<String, ReconcileError> {
        path_str(path, response)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| ReconcileError::Response {
                resource: self.resource.clone(),
                message: format!("no identifier at '{}' in {}", path, response),
            })
    }

    /// Wait `delay` before the next step, unless cancelled.
    ///
    /// Used between a submission and a one-shot lookup of what it started.
    pub async fn settle(&self, delay: Duration) -> Result<(), ReconcileError> {
        let start = Instant::now();
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(ReconcileError::Cancelled {
                resource: self.resource.clone(),
                elapsed: start.elapsed(),
            }),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Fetch every page of the list at `list_path`. See [`list_all`].
    pub async fn list_all(
        &self,
        operation: &str,
        request: &OperationRequest,
        list_path: &str,
    ) -> Result<Vec<Value>, ReconcileError> {
        list_all(&self.client, request, list_path, DEFAULT_PAGE_LIMIT)
            .await
            .map_err(|source| ReconcileError::operation(self.resource.as_str(), operation, source))
    }

    /// Pick the single candidate matching `predicate`.
    ///
    /// Zero or several matches are an [`ReconcileError::AmbiguousLookup`].
    pub fn select_unique<'a, P>(
        &self,
        description: &str,
        candidates: &'a [Value],
        predicate: P,
    ) -> Result<&'a Value, ReconcileError>
    where
        P: Fn(&Value) -> bool,
    {
        let matches: Vec<&Value> = candidates
            .iter()
            .filter(|&candidate| predicate(candidate))
            .collect();
        match matches.as_slice() {
            [only] => Ok(*only),
            _ => Err(ReconcileError::AmbiguousLookup {
                resource: self.resource.clone(),
                description: description.to_string(),
                matched: matches.len(),
            }),
        }
    }

    /// List candidates with `request` across every page, read the arrays at
    /// `list_path` and pick the single one matching `predicate`.
    pub async fn lookup_unique<P>(
        &self,
        operation: &str,
        request: &OperationRequest,
        list_path: &str,
        description: &str,
        predicate: P,
    ) -> Result<Value, ReconcileError>
    where
        P: Fn(&Value) -> bool,
    {
        let candidates = self.list_all(operation, request, list_path).await?;
        self.select_unique(description, &candidates, predicate)
            .cloned()
    }

    /// Poll `request` until the value at `status_path` reaches a target label.
    pub async fn wait_for_status(
        &self,
        spec: PollSpec,
        request: &OperationRequest,
        rules: &[ClassificationRule],
        status_path: &str,
    ) -> Result<PollState<Value>, ReconcileError> {
        let client = &self.client;
        self.wait(spec, move || read_status(client, request, rules, status_path))
            .await
    }

    /// Poll `request` until it reads as absent.
    ///
    /// Reads classified as not found map to [`DELETED`]; successful reads map
    /// to [`PRESENT`].
    pub async fn wait_for_deletion(
        &self,
        spec: PollSpec,
        request: &OperationRequest,
        rules: &[ClassificationRule],
    ) -> Result<(), ReconcileError> {
        let client = &self.client;
        self.wait(spec, move || read_presence(client, request, rules))
            .await?;
        info!(resource = %self.resource, "Resource deleted");
        Ok(())
    }

    /// Run `cleanup` if `result` failed.
    ///
    /// The original error is returned either way; if the cleanup fails too,
    /// both errors are reported.
    pub async fn compensate<T, F, Fut>(
        &self,
        result: Result<T, ReconcileError>,
        cleanup: F,
    ) -> Result<T, ReconcileError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ReconcileError>>,
    {
        let primary = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        warn!(resource = %self.resource, error = %primary, "Operation failed, cleaning up");
        match cleanup().await {
            Ok(()) => Err(primary),
            Err(cleanup_err) => {
                warn!(resource = %self.resource, error = %cleanup_err, "Cleanup failed");
                Err(primary.with_cleanup_failure(cleanup_err))
            },
        }
    }
}

/// Fetch every page of an offset-paged list and concatenate the items at
/// `list_path`.
///
/// Pages are requested with `offset` and `limit` query parameters. Paging stops
/// at an empty page or once the reported total (`total_num`, `totalSize` or
/// `total`) is reached. Without a reported total it stops at a page shorter
/// than `limit`.
pub async fn list_all<C: OperationClient + ?Sized>(
    client: &C,
    request: &OperationRequest,
    list_path: &str,
    limit: usize,
) -> Result<Vec<Value>, OperationError> {
    let limit = limit.max(1);
    let mut items = Vec::new();

    loop {
        let page_request = request
            .clone()
            .with_query("offset", items.len().to_string())
            .with_query("limit", limit.to_string());
        let page = client.request(&page_request).await?;

        let batch = match path_search(list_path, &page)
            .map_err(|e| OperationError::InvalidResponse(e.to_string()))?
        {
            Value::Array(batch) => batch,
            Value::Null => Vec::new(),
            other => {
                return Err(OperationError::InvalidResponse(format!(
                    "expected a list at '{}', got {}",
                    list_path, other
                )))
            },
        };
        let fetched = batch.len();
        items.extend(batch);

        let total = TOTAL_COUNT_PATHS
            .iter()
            .find_map(|path| page.get(*path).and_then(Value::as_u64));
        let done = match total {
            Some(total) => fetched == 0 || items.len() as u64 >= total,
            None => fetched < limit,
        };
        if done {
            return Ok(items);
        }
        debug!(fetched = items.len(), ?total, "Fetching next page");
    }
}

async fn read_status<C: OperationClient>(
    client: &C,
    request: &OperationRequest,
    rules: &[ClassificationRule],
    status_path: &str,
) -> Result<PollState<Value>, OperationError> {
    let value = classify_result(client.request(request).await, rules)?;
    let label = path_str(status_path, &value).unwrap_or_default();
    Ok(PollState::new(label, value))
}

async fn read_presence<C: OperationClient>(
    client: &C,
    request: &OperationRequest,
    rules: &[ClassificationRule],
) -> Result<PollState<Value>, OperationError> {
    match classify_result(client.request(request).await, rules) {
        Ok(value) => Ok(PollState::new(PRESENT, value)),
        Err(err) if err.is_not_found() => Ok(PollState::without_snapshot(DELETED)),
        Err(err) => Err(err),
    }
}
