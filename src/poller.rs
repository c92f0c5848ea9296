//! The state poller.
//!
//! A [`StatePoller`] repeatedly calls a refresh function until the remote
//! resource reports a target label, a label outside the known sets, or the
//! timeout runs out.
//!
//! ```ignore
//! use hemmer_reconcile::{PollSpec, PollState, StatePoller};
//! use std::time::Duration;
//!
//! let spec = PollSpec::new(["100"], ["200"]).with_timeout(Duration::from_secs(3600));
//! let state = StatePoller::new("css cluster c-1", spec)
//!     .poll(|| async { read_cluster_status(&client, "c-1").await })
//!     .await?;
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::{DEFAULT_POLL_DELAY, DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};
use crate::error::{OperationError, ReconcileError};
use crate::types::PollState;

/// How a label relates to a [`PollSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelClass {
    /// Keep polling.
    Pending,
    /// The desired state was reached.
    Target,
    /// Anything else. Polling stops with a failure.
    Failed,
}

/// Parameters of one wait.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollSpec {
    /// Labels meaning "still in progress".
    pub pending: Vec<String>,
    /// Labels meaning "done".
    pub target: Vec<String>,
    /// Total budget, measured from the start of the poll.
    pub timeout: Duration,
    /// Wait before the first refresh.
    pub delay: Duration,
    /// Wait between refreshes.
    pub interval: Duration,
    /// Consecutive target observations needed before success.
    pub continuous_target_occurrence: u32,
}

impl PollSpec {
    /// Create a spec with the default timeout, delay and interval.
    pub fn new<P, T, S>(pending: P, target: T) -> Self
    where
        P: IntoIterator<Item = S>,
        T: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            pending: pending.into_iter().map(Into::into).collect(),
            target: target.into_iter().map(Into::into).collect(),
            timeout: DEFAULT_TIMEOUT,
            delay: DEFAULT_POLL_DELAY,
            interval: DEFAULT_POLL_INTERVAL,
            continuous_target_occurrence: 1,
        }
    }

    /// Set the total budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the wait before the first refresh.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the wait between refreshes.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Require `count` consecutive target observations.
    pub fn with_continuous_target_occurrence(mut self, count: u32) -> Self {
        self.continuous_target_occurrence = count;
        self
    }

    /// Check that this poll spec is usable.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.target.is_empty() {
            return Err(ReconcileError::InvalidPollSpec(
                "target labels must not be empty".to_string(),
            ));
        }
        if let Some(label) = self.pending.iter().find(|label| self.target.contains(label)) {
            return Err(ReconcileError::InvalidPollSpec(format!(
                "label '{}' is both pending and target",
                label
            )));
        }
        if self.interval.is_zero() {
            return Err(ReconcileError::InvalidPollSpec(
                "interval must be positive".to_string(),
            ));
        }
        if self.timeout <= self.delay {
            return Err(ReconcileError::InvalidPollSpec(format!(
                "timeout {:?} must exceed delay {:?}",
                self.timeout, self.delay
            )));
        }
        if self.continuous_target_occurrence == 0 {
            return Err(ReconcileError::InvalidPollSpec(
                "continuous_target_occurrence must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Classify a label. Target is checked before pending.
    pub fn classify_label(&self, label: &str) -> LabelClass {
        if self.target.iter().any(|t| t == label) {
            LabelClass::Target
        } else if self.pending.iter().any(|p| p == label) {
            LabelClass::Pending
        } else {
            LabelClass::Failed
        }
    }
}

/// Drives a refresh function to a target state.
#[derive(Debug, Clone)]
pub struct StatePoller {
    resource: String,
    spec: PollSpec,
    cancellation: CancellationToken,
}

impl StatePoller {
    /// Create a poller for `resource` (used in logs and errors).
    pub fn new(resource: impl Into<String>, spec: PollSpec) -> Self {
        Self {
            resource: resource.into(),
            spec,
            cancellation: CancellationToken::new(),
        }
    }

    /// Abort the poll when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// The spec this poller runs.
    pub fn spec(&self) -> &PollSpec {
        &self.spec
    }

    /// Poll until a target label, a failure label, or the timeout.
    ///
    /// Refresh errors stop the poll immediately; any retry of transient
    /// errors belongs inside `refresh`. A single refresh that hangs is cut off
    /// at the deadline (or one interval after the call, whichever is later).
    #[instrument(skip_all, fields(resource = %self.resource))]
    pub async fn poll<T, F, Fut>(&self, mut refresh: F) -> Result<PollState<T>, ReconcileError>
    where
        T: Serialize,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<PollState<T>, OperationError>>,
    {
        self.spec.validate()?;

        let start = Instant::now();
        let deadline = start + self.spec.timeout;
        debug!(
            pending = ?self.spec.pending,
            target = ?self.spec.target,
            timeout = ?self.spec.timeout,
            "Waiting for state"
        );

        self.pause(self.spec.delay, start).await?;

        let mut last_label: Option<String> = None;
        let mut last_snapshot: Option<serde_json::Value> = None;
        let mut hits = 0u32;

        loop {
            let bound = deadline.max(Instant::now() + self.spec.interval);
            let state = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => return Err(self.cancelled(start)),
                result = timeout_at(bound, refresh()) => match result {
                    Ok(Ok(state)) => state,
                    Ok(Err(source)) => {
                        warn!(error = %source, "Refresh failed");
                        return Err(ReconcileError::Refresh {
                            resource: self.resource.clone(),
                            elapsed: start.elapsed(),
                            source,
                        });
                    },
                    Err(_) => {
                        warn!("Refresh did not complete before the deadline");
                        return Err(self.timed_out(start, last_label, last_snapshot));
                    },
                },
            };

            let elapsed = start.elapsed();
            let snapshot = state
                .snapshot
                .as_ref()
                .and_then(|s| serde_json::to_value(s).ok());

            match self.spec.classify_label(&state.label) {
                LabelClass::Target => {
                    hits += 1;
                    if hits >= self.spec.continuous_target_occurrence {
                        info!(label = %state.label, ?elapsed, "Reached target state");
                        return Ok(state);
                    }
                    debug!(label = %state.label, hits, "Target observed");
                },
                LabelClass::Pending => {
                    hits = 0;
                    debug!(label = %state.label, ?elapsed, "Still pending");
                },
                LabelClass::Failed => {
                    warn!(label = %state.label, ?elapsed, "Reached unexpected state");
                    return Err(ReconcileError::TerminalState {
                        resource: self.resource.clone(),
                        label: state.label,
                        expected: self.spec.target.clone(),
                        snapshot,
                    });
                },
            }

            last_label = Some(state.label);
            last_snapshot = snapshot;

            if elapsed >= self.spec.timeout {
                warn!(?elapsed, "Timed out waiting for state");
                return Err(self.timed_out(start, last_label, last_snapshot));
            }

            let remaining = self.spec.timeout - elapsed;
            self.pause(self.spec.interval.min(remaining), start).await?;
        }
    }

    async fn pause(&self, duration: Duration, start: Instant) -> Result<(), ReconcileError> {
        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(self.cancelled(start)),
            _ = sleep(duration) => Ok(()),
        }
    }

    fn cancelled(&self, start: Instant) -> ReconcileError {
        info!("Wait cancelled");
        ReconcileError::Cancelled {
            resource: self.resource.clone(),
            elapsed: start.elapsed(),
        }
    }

    fn timed_out(
        &self,
        start: Instant,
        last_label: Option<String>,
        snapshot: Option<serde_json::Value>,
    ) -> ReconcileError {
        ReconcileError::Timeout {
            resource: self.resource.clone(),
            elapsed: start.elapsed(),
            last_label,
            snapshot,
        }
    }
}
