//! DCS (Redis) instance diagnosis.
//!
//! Diagnosis can only start while the instance is running and no other task
//! holds it. The service rejects a busy instance with one of several error
//! codes; submission then waits for the instance and tries again.

use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::classify::{check_deleted, ClassificationRule};
use crate::client::OperationClient;
use crate::config::ResourceTimeouts;
use crate::error::{OperationError, ReconcileError};
use crate::orchestrator::{list_all, Orchestrator, DEFAULT_PAGE_LIMIT};
use crate::poller::PollSpec;
use crate::query::path_str;
use crate::types::{OperationRequest, PollState};

/// Instance status while it serves requests.
pub const INSTANCE_RUNNING: &str = "RUNNING";

/// Report status while the diagnosis runs.
pub const REPORT_DIAGNOSING: &str = "diagnosing";
/// Report status once the diagnosis finished.
pub const REPORT_FINISHED: &str = "finished";

/// Error codes rejecting a request because the instance is busy.
pub const BUSY_CODES: [&str; 7] = [
    "DCS.4026", "DCS.4049", "DCS.4096", "DCS.4097", "DCS.4111", "DCS.4113", "CBC.99003651",
];

const READY: &str = "READY";
const BUSY: &str = "BUSY";

const INSTANCE: &str = "v2/{project_id}/instances/{instance_id}";
const DIAGNOSIS: &str = "v2/{project_id}/instances/{instance_id}/diagnosis";
const REPORT: &str = "v2/{project_id}/diagnosis/{report_id}";

const REPORT_POLL: Duration = Duration::from_secs(2);

/// Rules recognising the "instance busy" rejection.
pub fn busy_rules() -> Vec<ClassificationRule> {
    vec![ClassificationRule::any_of(400, "error_code", BUSY_CODES)]
}

fn not_found_rules() -> Vec<ClassificationRule> {
    vec![ClassificationRule::status(404)]
}

/// Runs diagnosis tasks on one instance.
#[derive(Debug, Clone)]
pub struct DiagnosisOrchestrator<C> {
    client: C,
    instance_id: String,
    timeouts: ResourceTimeouts,
    cancellation: CancellationToken,
}

impl<C: OperationClient> DiagnosisOrchestrator<C> {
    /// Create an orchestrator for `instance_id`.
    pub fn new(client: C, instance_id: impl Into<String>) -> Self {
        Self {
            client,
            instance_id: instance_id.into(),
            timeouts: ResourceTimeouts::default().with_create(Duration::from_secs(30 * 60)),
            cancellation: CancellationToken::new(),
        }
    }

    /// Use the given operation timeouts.
    pub fn with_timeouts(mut self, timeouts: ResourceTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Abort waits when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    fn step(&self) -> Orchestrator<&C> {
        Orchestrator::new(&self.client, format!("dcs instance {}", self.instance_id))
            .with_cancellation(self.cancellation.clone())
    }

    fn diagnosis_request(&self) -> OperationRequest {
        OperationRequest::get(DIAGNOSIS).with_path_param("instance_id", self.instance_id.as_str())
    }

    /// Start a diagnosis and wait until its report is finished.
    ///
    /// Returns the report entry of the diagnosis list.
    #[instrument(skip_all, fields(instance_id = %self.instance_id))]
    pub async fn diagnose(&self, body: Value) -> Result<Value, ReconcileError> {
        let step = self.step();
        let submit = OperationRequest::post(DIAGNOSIS)
            .with_path_param("instance_id", self.instance_id.as_str())
            .with_body(body);
        let instance = OperationRequest::get(INSTANCE)
            .with_path_param("instance_id", self.instance_id.as_str());
        let ready_spec = PollSpec::new([BUSY], [READY]).with_timeout(self.timeouts.create);

        let response = step
            .submit_when_ready(
                "create diagnosis task",
                &submit,
                &busy_rules(),
                ready_spec,
                || read_instance(&self.client, &instance),
            )
            .await?;
        let report_id = step.extract_id(&response, "report_id")?;
        info!(%report_id, "Diagnosis started");

        let list = self.diagnosis_request();
        let spec = PollSpec::new([REPORT_DIAGNOSING], [REPORT_FINISHED])
            .with_timeout(self.timeouts.create)
            .with_delay(REPORT_POLL)
            .with_interval(REPORT_POLL);
        let state = step
            .wait(spec, || read_report(&self.client, &list, &report_id))
            .await?;
        Ok(state.snapshot.unwrap_or_default())
    }

    /// Read a diagnosis report. `None` means it no longer exists.
    pub async fn read(&self, report_id: &str) -> Result<Option<Value>, ReconcileError> {
        let request = OperationRequest::get(REPORT).with_path_param("report_id", report_id);
        self.step()
            .read("show diagnosis report", &request, &not_found_rules())
            .await
    }

    /// Delete a diagnosis report. Deleting a missing report succeeds.
    pub async fn delete(&self, report_id: &str) -> Result<(), ReconcileError> {
        let request = OperationRequest::delete(DIAGNOSIS)
            .with_path_param("instance_id", self.instance_id.as_str())
            .with_body(json!({"report_id_list": [report_id]}));
        check_deleted(
            self.step()
                .submit_classified("delete diagnosis report", &request, &not_found_rules())
                .await,
        )?;
        Ok(())
    }
}

async fn read_instance<C: OperationClient>(
    client: &C,
    request: &OperationRequest,
) -> Result<PollState<Value>, OperationError> {
    let instance = client.request(request).await?;
    let label = match path_str("status", &instance).as_deref() {
        Some(INSTANCE_RUNNING) => READY,
        Some("ERROR") => "ERROR",
        _ => BUSY,
    };
    Ok(PollState::new(label, instance))
}

/// The report is looked up in every page of the instance's diagnosis list; a
/// report missing from the list is an error.
async fn read_report<C: OperationClient>(
    client: &C,
    request: &OperationRequest,
    report_id: &str,
) -> Result<PollState<Value>, OperationError> {
    let reports = list_all(client, request, "diagnosis_report_list", DEFAULT_PAGE_LIMIT).await?;
    let report = reports
        .into_iter()
        .find(|report| report["report_id"].as_str() == Some(report_id))
        .ok_or_else(|| OperationError::NotFound(format!("diagnosis report {}", report_id)))?;
    let label = path_str("status", &report).unwrap_or_default();
    Ok(PollState::new(label, report))
}
