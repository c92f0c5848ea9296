//! Logstash pipeline lifecycle on a CSS Logstash cluster.
//!
//! Starting or stopping pipelines is asynchronous: the call returns at once
//! and the pipeline list converges over the following minutes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::client::OperationClient;
use crate::config::ResourceTimeouts;
use crate::error::{OperationError, ReconcileError};
use crate::orchestrator::Orchestrator;
use crate::poller::PollSpec;
use crate::types::{OperationRequest, PollState};

/// Pipeline status while it runs.
pub const PIPELINE_WORKING: &str = "working";
/// Pipeline status after a failed start.
pub const PIPELINE_FAILED: &str = "failed";

const STARTING: &str = "STARTING";
const RUNNING: &str = "RUNNING";
const STOPPING: &str = "STOPPING";
const STOPPED: &str = "STOPPED";
const FAILED: &str = "FAILED";

/// One entry of the pipeline list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pipeline {
    /// Configuration name.
    pub name: String,
    /// Pipeline status, e.g. `working`.
    pub status: String,
    /// Whether keepalive is enabled.
    #[serde(rename = "keepAlive")]
    pub keep_alive: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PipelineList {
    pipelines: Vec<Pipeline>,
}

/// Starts and stops pipelines of one cluster.
#[derive(Debug, Clone)]
pub struct PipelineOrchestrator<C> {
    client: C,
    cluster_id: String,
    timeouts: ResourceTimeouts,
    cancellation: CancellationToken,
}

impl<C: OperationClient> PipelineOrchestrator<C> {
    /// Create an orchestrator for the pipelines of `cluster_id`.
    pub fn new(client: C, cluster_id: impl Into<String>) -> Self {
        Self {
            client,
            cluster_id: cluster_id.into(),
            timeouts: ResourceTimeouts::default(),
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

    fn resource(&self) -> String {
        format!("logstash pipelines of cluster {}", self.cluster_id)
    }

    fn step(&self) -> Orchestrator<&C> {
        Orchestrator::new(&self.client, self.resource())
            .with_cancellation(self.cancellation.clone())
    }

    /// The distinct pipeline names of a start or stop call. An empty set is
    /// rejected.
    fn pipeline_names<'a>(
        &self,
        operation: &str,
        names: &'a [String],
    ) -> Result<BTreeSet<&'a str>, ReconcileError> {
        let names: BTreeSet<&str> = names.iter().map(String::as_str).collect();
        if names.is_empty() {
            return Err(ReconcileError::operation(
                self.resource(),
                operation,
                OperationError::InvalidRequest("no pipeline names given".to_string()),
            ));
        }
        Ok(names)
    }

    fn request(&self, action: &str) -> OperationRequest {
        OperationRequest::post(format!(
            "v1.0/{{project_id}}/clusters/{{cluster_id}}/lgsconf/{}",
            action
        ))
        .with_path_param("cluster_id", self.cluster_id.as_str())
    }

    fn list_request(&self) -> OperationRequest {
        OperationRequest::get("v1.0/{project_id}/clusters/{cluster_id}/lgsconf/listpipelines")
            .with_path_param("cluster_id", self.cluster_id.as_str())
    }

    /// List the pipelines of the cluster.
    pub async fn list(&self) -> Result<Vec<Pipeline>, ReconcileError> {
        let response = self
            .step()
            .submit("list pipelines", &self.list_request())
            .await?;
        decode_pipelines(&response)
            .map(|list| list.pipelines)
            .map_err(|err| ReconcileError::Response {
                resource: self.resource(),
                message: err.message().to_string(),
            })
    }

    /// Start the named pipeline configurations and wait until every one of
    /// them is working.
    #[instrument(skip_all, fields(cluster_id = %self.cluster_id))]
    pub async fn start(
        &self,
        names: &[String],
        keep_alive: bool,
    ) -> Result<Vec<Pipeline>, ReconcileError> {
        let wanted = self.pipeline_names("start pipelines", names)?;
        let step = self.step();
        let body = json!({"names": wanted, "keepAlive": keep_alive});
        step.submit("start pipelines", &self.request("start").with_body(body))
            .await?;

        let list = self.list_request();
        let spec = PollSpec::new([STARTING], [RUNNING]).with_timeout(self.timeouts.update);
        let state = step
            .wait(spec, || read_started(&self.client, &list, &wanted))
            .await?;
        Ok(state.snapshot.unwrap_or_default())
    }

    /// Stop the named pipelines and wait until none of them is working.
    #[instrument(skip_all, fields(cluster_id = %self.cluster_id))]
    pub async fn stop(&self, names: &[String]) -> Result<(), ReconcileError> {
        let wanted = self.pipeline_names("stop pipelines", names)?;
        let step = self.step();
        step.submit(
            "stop pipelines",
            &self.request("stop").with_body(json!({"names": wanted})),
        )
        .await?;

        let list = self.list_request();
        let spec = PollSpec::new([STOPPING], [STOPPED]).with_timeout(self.timeouts.update);
        step.wait(spec, || read_stopped(&self.client, &list, &wanted))
            .await?;
        Ok(())
    }
}

fn decode_pipelines(value: &Value) -> Result<PipelineList, OperationError> {
    PipelineList::deserialize(value)
        .map_err(|e| OperationError::InvalidResponse(format!("invalid pipeline list: {}", e)))
}

fn named<'a>(
    pipelines: &'a [Pipeline],
    names: &'a BTreeSet<&'a str>,
) -> impl Iterator<Item = &'a Pipeline> {
    pipelines
        .iter()
        .filter(move |pipeline| names.contains(pipeline.name.as_str()))
}

/// `RUNNING` once every named pipeline works, `FAILED` if one of them failed.
fn started_label(pipelines: &[Pipeline], names: &BTreeSet<&str>) -> &'static str {
    if named(pipelines, names).any(|p| p.status == PIPELINE_FAILED) {
        return FAILED;
    }
    let working: BTreeSet<&str> = named(pipelines, names)
        .filter(|p| p.status == PIPELINE_WORKING)
        .map(|p| p.name.as_str())
        .collect();
    if working.len() == names.len() {
        RUNNING
    } else {
        STARTING
    }
}

fn stopped_label(pipelines: &[Pipeline], names: &BTreeSet<&str>) -> &'static str {
    if named(pipelines, names).any(|p| p.status == PIPELINE_WORKING) {
        STOPPING
    } else {
        STOPPED
    }
}

async fn read_started<C: OperationClient>(
    client: &C,
    request: &OperationRequest,
    names: &BTreeSet<&str>,
) -> Result<PollState<Vec<Pipeline>>, OperationError> {
    let pipelines = decode_pipelines(&client.request(request).await?)?.pipelines;
    Ok(PollState::new(started_label(&pipelines, names), pipelines))
}

async fn read_stopped<C: OperationClient>(
    client: &C,
    request: &OperationRequest,
    names: &BTreeSet<&str>,
) -> Result<PollState<Vec<Pipeline>>, OperationError> {
    let pipelines = decode_pipelines(&client.request(request).await?)?.pipelines;
    Ok(PollState::new(stopped_label(&pipelines, names), pipelines))
}
