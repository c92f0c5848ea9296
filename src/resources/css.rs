//! CSS (Elasticsearch) cluster lifecycle.
//!
//! Cluster status codes: `100` in process, `200` available, `303`
//! unavailable. A cluster is *ready* for the next mutation when it is
//! available, has no pending actions and every instance is available.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::classify::{check_deleted, ClassificationRule};
use crate::client::OperationClient;
use crate::config::{ResourceTimeouts, DEFAULT_POLL_DELAY};
use crate::error::{OperationError, ReconcileError};
use crate::orchestrator::{deletion_spec, Orchestrator};
use crate::poller::PollSpec;
use crate::query::{path_search_or, path_str};
use crate::types::{OperationRequest, PollState};

/// Cluster is being created or changed.
pub const STATUS_IN_PROCESS: &str = "100";
/// Cluster is available.
pub const STATUS_AVAILABLE: &str = "200";
/// Cluster is unavailable.
pub const STATUS_UNAVAILABLE: &str = "303";

const READY: &str = "READY";
const BUSY: &str = "BUSY";
const FAILED: &str = "FAILED";

const TASK_RUNNING: &str = "RUNNING";
const TASK_SUCCESS: &str = "SUCCESS";

const CLUSTERS: &str = "v1.0/{project_id}/clusters";
const CLUSTER: &str = "v1.0/{project_id}/clusters/{cluster_id}";

/// Errors meaning "the cluster does not exist".
pub fn not_found_rules() -> Vec<ClassificationRule> {
    vec![
        // CSS.0015: the cluster does not exist
        ClassificationRule::new(403, "errCode", "CSS.0015"),
        ClassificationRule::status(404),
    ]
}

/// One node of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterInstance {
    /// Instance id.
    pub id: String,
    /// Instance name.
    pub name: String,
    /// Instance status code.
    #[serde(deserialize_with = "string_or_number")]
    pub status: String,
    /// Node role, e.g. `ess` or `ess-master`.
    #[serde(rename = "type")]
    pub kind: String,
}

/// A cluster as reported by the show-cluster call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cluster {
    /// Cluster id.
    pub id: String,
    /// Cluster name.
    pub name: String,
    /// Status code.
    #[serde(deserialize_with = "string_or_number")]
    pub status: String,
    /// Access endpoint.
    pub endpoint: Option<String>,
    /// Behaviours currently running on the cluster.
    #[serde(deserialize_with = "null_as_default")]
    pub actions: Vec<String>,
    /// Nodes.
    #[serde(deserialize_with = "null_as_default")]
    pub instances: Vec<ClusterInstance>,
}

impl Cluster {
    /// Decode a show-cluster response.
    pub fn from_value(value: &Value) -> Result<Self, ReconcileError> {
        Self::deserialize(value).map_err(|e| ReconcileError::Response {
            resource: "css cluster".to_string(),
            message: e.to_string(),
        })
    }

    /// Available, idle and with every node available.
    pub fn is_ready(&self) -> bool {
        self.status == STATUS_AVAILABLE
            && self.actions.is_empty()
            && !self.instances.is_empty()
            && self
                .instances
                .iter()
                .all(|instance| instance.status == STATUS_AVAILABLE)
    }
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Result of an index snapshot creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id.
    pub id: String,
    /// Final status.
    pub status: String,
}

/// Lifecycle transitions of a CSS cluster.
#[derive(Debug, Clone)]
pub struct ClusterOrchestrator<C> {
    client: C,
    timeouts: ResourceTimeouts,
    cancellation: CancellationToken,
}

impl<C: OperationClient> ClusterOrchestrator<C> {
    /// Create an orchestrator with default timeouts.
    pub fn new(client: C) -> Self {
        Self {
            client,
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

    fn step(&self, resource: String) -> Orchestrator<&C> {
        Orchestrator::new(&self.client, resource).with_cancellation(self.cancellation.clone())
    }

    fn readiness_spec(&self) -> PollSpec {
        PollSpec::new([BUSY], [READY]).with_timeout(self.timeouts.update)
    }

    fn task_spec(&self) -> PollSpec {
        PollSpec::new([TASK_RUNNING], [TASK_SUCCESS]).with_timeout(self.timeouts.update)
    }

    /// Create a cluster and wait until it is available.
    #[instrument(skip_all)]
    pub async fn create(&self, body: Value) -> Result<Cluster, ReconcileError> {
        let step = self.step("css cluster".to_string());
        let response = step
            .submit("create cluster", &OperationRequest::post(CLUSTERS).with_body(body))
            .await?;
        let cluster_id = step.extract_id(&response, "cluster.id")?;
        info!(%cluster_id, "Cluster creation submitted");

        let step = self.step(format!("css cluster {}", cluster_id));
        let show = show_request(&cluster_id);
        let spec = PollSpec::new([STATUS_IN_PROCESS], [STATUS_AVAILABLE])
            .with_timeout(self.timeouts.create);
        let state = step.wait(spec, || read_status(&self.client, &show)).await?;

        let mut cluster = Cluster::from_value(&state.snapshot.unwrap_or_default())?;
        if cluster.id.is_empty() {
            cluster.id = cluster_id;
        }
        Ok(cluster)
    }

    /// Read a cluster. `None` means it no longer exists.
    pub async fn read(&self, cluster_id: &str) -> Result<Option<Cluster>, ReconcileError> {
        let step = self.step(format!("css cluster {}", cluster_id));
        let value = step
            .read("show cluster", &show_request(cluster_id), &not_found_rules())
            .await?;
        value.as_ref().map(Cluster::from_value).transpose()
    }

    /// Delete a cluster and wait until it is gone. Deleting a missing cluster
    /// succeeds.
    #[instrument(skip_all, fields(cluster_id = %cluster_id))]
    pub async fn delete(&self, cluster_id: &str) -> Result<(), ReconcileError> {
        let step = self.step(format!("css cluster {}", cluster_id));
        let rules = not_found_rules();
        let request = OperationRequest::delete(CLUSTER).with_path_param("cluster_id", cluster_id);

        let submitted = check_deleted(step.submit_classified("delete cluster", &request, &rules).await)?;
        if submitted.is_none() {
            info!("Cluster already deleted");
            return Ok(());
        }

        step.wait_for_deletion(
            deletion_spec(self.timeouts.delete),
            &show_request(cluster_id),
            &rules,
        )
        .await
    }

    /// Wait until the cluster is ready for the next mutation.
    pub async fn wait_ready(&self, cluster_id: &str) -> Result<Cluster, ReconcileError> {
        let step = self.step(format!("css cluster {}", cluster_id));
        let show = show_request(cluster_id);
        let state = step
            .await_ready(self.readiness_spec(), || read_readiness(&self.client, &show))
            .await?;
        Cluster::from_value(&state.snapshot.unwrap_or_default())
    }

    /// Add nodes or storage (`role_extend`), then wait for readiness.
    #[instrument(skip_all, fields(cluster_id = %cluster_id))]
    pub async fn extend(&self, cluster_id: &str, body: Value) -> Result<Cluster, ReconcileError> {
        self.wait_ready(cluster_id).await?;
        let request = OperationRequest::post("v1.0/{project_id}/clusters/{cluster_id}/role_extend")
            .with_path_param("cluster_id", cluster_id)
            .with_body(body);
        self.step(format!("css cluster {}", cluster_id))
            .submit("extend cluster", &request)
            .await?;
        self.wait_ready(cluster_id).await
    }

    /// Restart the cluster and wait for readiness.
    #[instrument(skip_all, fields(cluster_id = %cluster_id))]
    pub async fn restart(&self, cluster_id: &str) -> Result<Cluster, ReconcileError> {
        self.wait_ready(cluster_id).await?;
        let request = OperationRequest::post("v1.0/{project_id}/clusters/{cluster_id}/restart")
            .with_path_param("cluster_id", cluster_id)
            .with_body(json!({}));
        self.step(format!("css cluster {}", cluster_id))
            .submit("restart cluster", &request)
            .await?;
        self.wait_ready(cluster_id).await
    }

    /// Migrate the `inst_type` nodes to other availability zones, wait for the
    /// migration task and restart the cluster afterwards.
    #[instrument(skip_all, fields(cluster_id = %cluster_id, inst_type = %inst_type))]
    pub async fn migrate_az(
        &self,
        cluster_id: &str,
        inst_type: &str,
        body: Value,
    ) -> Result<Cluster, ReconcileError> {
        self.wait_ready(cluster_id).await?;
        let step = self.step(format!("css cluster {}", cluster_id));
        let request = OperationRequest::post(
            "v1.0/{project_id}/clusters/{cluster_id}/inst-type/{inst_type}/azmigrate",
        )
        .with_path_param("cluster_id", cluster_id)
        .with_path_param("inst_type", inst_type)
        .with_body(body);
        step.submit("migrate availability zone", &request).await?;

        let tasks = upgrade_detail_request(cluster_id, Some("AZ_MIGRATION"));
        self.wait_for_task(&step, &tasks, "running AZ migration task")
            .await?;
        info!("AZ migration finished, restarting cluster");

        self.restart(cluster_id).await
    }

    /// Upgrade the engine image of the `inst_type` nodes. If the upgrade task
    /// fails, it is aborted before the error is returned.
    #[instrument(skip_all, fields(cluster_id = %cluster_id, inst_type = %inst_type))]
    pub async fn upgrade(
        &self,
        cluster_id: &str,
        inst_type: &str,
        body: Value,
    ) -> Result<Cluster, ReconcileError> {
        self.wait_ready(cluster_id).await?;
        let step = self.step(format!("css cluster {}", cluster_id));
        let request = OperationRequest::post(
            "v1.0/{project_id}/clusters/{cluster_id}/inst-type/{inst_type}/image/upgrade",
        )
        .with_path_param("cluster_id", cluster_id)
        .with_path_param("inst_type", inst_type)
        .with_body(body);
        step.submit("upgrade cluster", &request).await?;
        step.settle(DEFAULT_POLL_DELAY).await?;

        let tasks = upgrade_detail_request(cluster_id, None);
        let task = step
            .lookup_unique("list upgrade tasks", &tasks, "detailList", "running upgrade task", |t| {
                task_status(t) == TASK_RUNNING
            })
            .await?;
        let task_id = step.extract_id(&task, "id")?;

        let status_path = format!("detailList[?id=='{}'] | [0].status", task_id);
        let outcome = step
            .wait_for_status(self.task_spec(), &tasks, &[], &status_path)
            .await;
        step.compensate(outcome, || self.abort_upgrade(cluster_id, &task_id))
            .await?;

        self.wait_ready(cluster_id).await
    }

    async fn abort_upgrade(&self, cluster_id: &str, action_id: &str) -> Result<(), ReconcileError> {
        warn!(%cluster_id, %action_id, "Aborting upgrade task");
        let request =
            OperationRequest::put("v1.0/{project_id}/clusters/{cluster_id}/upgrade/{action_id}/retry")
                .with_path_param("cluster_id", cluster_id)
                .with_path_param("action_id", action_id)
                .with_query("retry_mode", "abort");
        self.step(format!("css cluster {}", cluster_id))
            .submit("abort upgrade", &request)
            .await
            .map(|_| ())
    }

    /// Create an index snapshot and wait until it completes.
    #[instrument(skip_all, fields(cluster_id = %cluster_id))]
    pub async fn create_snapshot(
        &self,
        cluster_id: &str,
        body: Value,
    ) -> Result<Snapshot, ReconcileError> {
        let step = self.step(format!("css cluster {}", cluster_id));
        let request = OperationRequest::post("v1.0/{project_id}/clusters/{cluster_id}/index_snapshot")
            .with_path_param("cluster_id", cluster_id)
            .with_body(body);
        let response = step.submit("create snapshot", &request).await?;
        let snapshot_id = step.extract_id(&response, "backup.id")?;

        let list = OperationRequest::get("v1.0/{project_id}/clusters/{cluster_id}/index_snapshots")
            .with_path_param("cluster_id", cluster_id);
        let status_path = format!("backups[?id=='{}'] | [0].status", snapshot_id);
        let spec = PollSpec::new(["BUILDING"], ["COMPLETED"]).with_timeout(self.timeouts.create);
        let state = step
            .wait_for_status(spec, &list, &[], &status_path)
            .await?;

        Ok(Snapshot {
            id: snapshot_id,
            status: state.label,
        })
    }

    /// Restore an index snapshot into the cluster and wait for readiness.
    #[instrument(skip_all, fields(cluster_id = %cluster_id, snapshot_id = %snapshot_id))]
    pub async fn restore_snapshot(
        &self,
        cluster_id: &str,
        snapshot_id: &str,
        body: Value,
    ) -> Result<Cluster, ReconcileError> {
        let request = OperationRequest::post(
            "v1.0/{project_id}/clusters/{cluster_id}/index_snapshot/{snapshot_id}/restore",
        )
        .with_path_param("cluster_id", cluster_id)
        .with_path_param("snapshot_id", snapshot_id)
        .with_body(body);
        self.step(format!("css cluster {}", cluster_id))
            .submit("restore snapshot", &request)
            .await?;
        self.wait_ready(cluster_id).await
    }

    /// Back up the cluster logs and wait for the backup job.
    ///
    /// Returns the finished job record.
    #[instrument(skip_all, fields(cluster_id = %cluster_id))]
    pub async fn backup_logs(&self, cluster_id: &str, body: Value) -> Result<Value, ReconcileError> {
        let step = self.step(format!("css cluster {}", cluster_id));
        let request = OperationRequest::post("v1.0/{project_id}/clusters/{cluster_id}/logs/collect")
            .with_path_param("cluster_id", cluster_id)
            .with_body(body);
        step.submit("back up logs", &request).await?;
        step.settle(DEFAULT_POLL_DELAY).await?;

        let records = OperationRequest::get("v1.0/{project_id}/clusters/{cluster_id}/logs/records")
            .with_path_param("cluster_id", cluster_id);
        let job = step
            .lookup_unique(
                "list log backups",
                &records,
                "clusterLogRecord",
                "running log backup job",
                |job| task_status(job) == TASK_RUNNING,
            )
            .await?;
        let job_id = step.extract_id(&job, "id")?;

        let status_path = format!("clusterLogRecord[?id=='{}'] | [0]", job_id);
        let spec = self.task_spec();
        let state = step
            .wait(spec, || read_record(&self.client, &records, &status_path))
            .await?;
        Ok(state.snapshot.unwrap_or_default())
    }

    async fn wait_for_task(
        &self,
        step: &Orchestrator<&C>,
        tasks: &OperationRequest,
        description: &str,
    ) -> Result<PollState<Value>, ReconcileError> {
        step.settle(DEFAULT_POLL_DELAY).await?;
        let task = step
            .lookup_unique("list cluster tasks", tasks, "detailList", description, |t| {
                task_status(t) == TASK_RUNNING
            })
            .await?;
        let task_id = step.extract_id(&task, "id")?;
        let status_path = format!("detailList[?id=='{}'] | [0].status", task_id);
        step.wait_for_status(self.task_spec(), tasks, &[], &status_path)
            .await
    }
}

fn show_request(cluster_id: &str) -> OperationRequest {
    OperationRequest::get(CLUSTER).with_path_param("cluster_id", cluster_id)
}

fn upgrade_detail_request(cluster_id: &str, action_mode: Option<&str>) -> OperationRequest {
    let request = OperationRequest::get("v1.0/{project_id}/clusters/{cluster_id}/upgrade/detail")
        .with_path_param("cluster_id", cluster_id);
    match action_mode {
        Some(mode) => request.with_query("action_mode", mode),
        None => request,
    }
}

fn task_status(task: &Value) -> String {
    path_str("status", task).unwrap_or_default()
}

/// Label a show-cluster response: the status code, or `FAILED` when the
/// cluster reports a failure reason.
fn cluster_label(value: &Value) -> String {
    match path_str("failed_reasons.errorCode", value) {
        Some(code) if !code.is_empty() => FAILED.to_string(),
        _ => path_str("status", value).unwrap_or_default(),
    }
}

async fn read_status<C: OperationClient>(
    client: &C,
    request: &OperationRequest,
) -> Result<PollState<Value>, OperationError> {
    let value = client.request(request).await?;
    Ok(PollState::new(cluster_label(&value), value))
}

async fn read_readiness<C: OperationClient>(
    client: &C,
    request: &OperationRequest,
) -> Result<PollState<Value>, OperationError> {
    let value = client.request(request).await?;
    let ready = Cluster::from_value(&value)
        .map(|cluster| cluster.is_ready())
        .unwrap_or(false);
    let label = if ready { READY } else { BUSY };
    Ok(PollState::new(label, value))
}

async fn read_record<C: OperationClient>(
    client: &C,
    request: &OperationRequest,
    record_path: &str,
) -> Result<PollState<Value>, OperationError> {
    let value = client.request(request).await?;
    let record = path_search_or(record_path, &value, Value::Null);
    Ok(PollState::new(task_status(&record), record))
}
