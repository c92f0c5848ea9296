//! IoTDA batch tasks.
//!
//! A batch task may reference a previously uploaded task file. The task runs
//! asynchronously and ends in one of `Success`, `Fail`, `PartialSuccess` or
//! `Stopped`; only `Success` counts as done.

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::classify::{check_deleted, ClassificationRule};
use crate::client::OperationClient;
use crate::config::ResourceTimeouts;
use crate::error::ReconcileError;
use crate::orchestrator::Orchestrator;
use crate::poller::PollSpec;
use crate::types::{OperationRequest, PollState};

/// Task statuses while it has not finished.
pub const PENDING_STATUSES: [&str; 4] = ["Initializing", "Waitting", "Processing", "Stopping"];
/// Status of a task that finished for every target.
pub const STATUS_SUCCESS: &str = "Success";

const TASKS: &str = "v5/iot/{project_id}/batchtasks";
const TASK: &str = "v5/iot/{project_id}/batchtasks/{task_id}";
const FILES: &str = "v5/iot/{project_id}/batchtask-files";
const FILE: &str = "v5/iot/{project_id}/batchtask-files/{file_id}";

fn not_found_rules() -> Vec<ClassificationRule> {
    vec![ClassificationRule::status(404)]
}

/// Runs batch tasks to completion.
#[derive(Debug, Clone)]
pub struct BatchTaskOrchestrator<C> {
    client: C,
    timeouts: ResourceTimeouts,
    cancellation: CancellationToken,
}

impl<C: OperationClient> BatchTaskOrchestrator<C> {
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

    /// Create a batch task and wait until it succeeded.
    ///
    /// When `file` is given it is uploaded first and its id is set as
    /// `document.file_id` of the task body. If the task cannot be created the
    /// uploaded file is deleted again.
    #[instrument(skip_all)]
    pub async fn create(&self, mut body: Value, file: Option<Value>) -> Result<Value, ReconcileError> {
        let step = self.step("iotda batch task".to_string());

        let file_id = match file {
            Some(file) => {
                let response = step
                    .submit("upload task file", &OperationRequest::post(FILES).with_body(file))
                    .await?;
                let file_id = step.extract_id(&response, "file_id")?;
                info!(%file_id, "Task file uploaded");
                set_file_id(&mut body, &file_id);
                Some(file_id)
            },
            None => None,
        };

        let submitted = step
            .submit("create batch task", &OperationRequest::post(TASKS).with_body(body))
            .await
            .and_then(|response| step.extract_id(&response, "task_id"));
        let task_id = match file_id {
            Some(file_id) => {
                step.compensate(submitted, || self.delete_file(&file_id))
                    .await?
            },
            None => submitted?,
        };
        info!(%task_id, "Batch task created");

        let spec = PollSpec::new(PENDING_STATUSES, [STATUS_SUCCESS])
            .with_timeout(self.timeouts.create);
        let state: PollState<Value> = self
            .step(format!("iotda batch task {}", task_id))
            .wait_for_status(spec, &task_request(&task_id), &[], "batchtask.status")
            .await?;
        Ok(state.snapshot.unwrap_or_default())
    }

    /// Read a task. `None` means it no longer exists.
    pub async fn read(&self, task_id: &str) -> Result<Option<Value>, ReconcileError> {
        self.step(format!("iotda batch task {}", task_id))
            .read("show batch task", &task_request(task_id), &not_found_rules())
            .await
    }

    /// Delete a task. Deleting a missing task succeeds.
    pub async fn delete(&self, task_id: &str) -> Result<(), ReconcileError> {
        let request = OperationRequest::delete(TASK).with_path_param("task_id", task_id);
        let deleted = check_deleted(
            self.step(format!("iotda batch task {}", task_id))
                .submit_classified("delete batch task", &request, &not_found_rules())
                .await,
        )?;
        if deleted.is_none() {
            info!(%task_id, "Batch task already deleted");
        }
        Ok(())
    }

    /// Delete an uploaded task file. Deleting a missing file succeeds.
    pub async fn delete_file(&self, file_id: &str) -> Result<(), ReconcileError> {
        let request = OperationRequest::delete(FILE).with_path_param("file_id", file_id);
        check_deleted(
            self.step(format!("iotda batch task file {}", file_id))
                .submit_classified("delete task file", &request, &not_found_rules())
                .await,
        )?;
        Ok(())
    }
}

fn task_request(task_id: &str) -> OperationRequest {
    OperationRequest::get(TASK).with_path_param("task_id", task_id)
}

fn set_file_id(body: &mut Value, file_id: &str) {
    if !body.is_object() {
        *body = Value::Object(Default::default());
    }
    if let Value::Object(fields) = body {
        let document = fields
            .entry("document")
            .or_insert_with(|| Value::Object(Default::default()));
        if !document.is_object() {
            *document = Value::Object(Default::default());
        }
        if let Value::Object(document) = document {
            document.insert("file_id".to_string(), Value::String(file_id.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{assert_terminal_state, ScriptedClient};
    use crate::types::Method;
    use serde_json::json;

    const TASKS_PATH: &str = "v5/iot/project-1/batchtasks";
    const TASK_PATH: &str = "v5/iot/project-1/batchtasks/t-1";
    const FILES_PATH: &str = "v5/iot/project-1/batchtask-files";
    const FILE_PATH: &str = "v5/iot/project-1/batchtask-files/f-1";

    fn task(status: &str) -> Value {
        json!({"batchtask": {"task_id": "t-1", "status": status}})
    }

    #[test]
    fn test_set_file_id() {
        let mut body = json!({"task_type": "createDevices"});
        set_file_id(&mut body, "f-1");
        assert_eq!(body["document"]["file_id"], "f-1");
        assert_eq!(body["task_type"], "createDevices");

        let mut body = json!({"document": {"name": "x"}});
        set_file_id(&mut body, "f-2");
        assert_eq!(body["document"], json!({"name": "x", "file_id": "f-2"}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_with_file_waits_for_success() {
        let client = ScriptedClient::new();
        client
            .respond_ok(Method::Post, FILES_PATH, json!({"file_id": "f-1"}))
            .respond_ok(Method::Post, TASKS_PATH, json!({"task_id": "t-1"}))
            .respond_ok(Method::Get, TASK_PATH, task("Waitting"))
            .respond_ok(Method::Get, TASK_PATH, task("Processing"))
            .respond_ok(Method::Get, TASK_PATH, task("Success"));

        let result = BatchTaskOrchestrator::new(&client)
            .create(json!({"task_type": "createDevices"}), Some(json!({"file": "devices.xlsx"})))
            .await
            .unwrap();

        assert_eq!(result["batchtask"]["status"], "Success");
        assert_eq!(client.call_count(Method::Get, TASK_PATH), 3);
        let created = client.calls_to(Method::Post, TASKS_PATH);
        assert_eq!(created[0].body.as_ref().unwrap()["document"]["file_id"], "f-1");
        assert_eq!(client.call_count(Method::Delete, FILE_PATH), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_success_is_terminal() {
        let client = ScriptedClient::new();
        client
            .respond_ok(Method::Post, TASKS_PATH, json!({"task_id": "t-1"}))
            .respond_ok(Method::Get, TASK_PATH, task("Processing"))
            .respond_ok(Method::Get, TASK_PATH, task("PartialSuccess"));

        let err = BatchTaskOrchestrator::new(&client)
            .create(json!({"task_type": "freezeDevices"}), None)
            .await
            .unwrap_err();
        assert_terminal_state(&err, "PartialSuccess");
        assert_eq!(
            err.last_snapshot().unwrap()["batchtask"]["status"],
            "PartialSuccess"
        );
    }

    #[tokio::test]
    async fn test_failed_creation_deletes_file() {
        let client = ScriptedClient::new();
        client
            .respond_ok(Method::Post, FILES_PATH, json!({"file_id": "f-1"}))
            .respond_status(
                Method::Post,
                TASKS_PATH,
                400,
                r#"{"error_code":"IOTDA.000006","error_msg":"invalid task type"}"#,
            )
            .respond_ok(Method::Delete, FILE_PATH, Value::Null);

        let err = BatchTaskOrchestrator::new(&client)
            .create(json!({"task_type": "bogus"}), Some(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Operation { .. }));
        assert_eq!(client.call_count(Method::Delete, FILE_PATH), 1);
    }

    #[tokio::test]
    async fn test_failed_cleanup_is_reported() {
        let client = ScriptedClient::new();
        client
            .respond_ok(Method::Post, FILES_PATH, json!({"file_id": "f-1"}))
            .respond_ok(Method::Post, TASKS_PATH, json!({}))
            .respond_status(Method::Delete, FILE_PATH, 500, "internal error");

        let err = BatchTaskOrchestrator::new(&client)
            .create(json!({}), Some(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::Compensation { .. }));
        assert!(err.to_string().contains("no identifier at 'task_id'"));
    }

    #[tokio::test]
    async fn test_read_and_delete_missing_task() {
        let client = ScriptedClient::new();
        client
            .respond_status(Method::Get, TASK_PATH, 404, "")
            .respond_status(
                Method::Delete,
                TASK_PATH,
                404,
                r#"{"error_code":"IOTDA.014000","error_msg":"task not found"}"#,
            );

        let orchestrator = BatchTaskOrchestrator::new(&client);
        assert!(orchestrator.read("t-1").await.unwrap().is_none());
        orchestrator.delete("t-1").await.unwrap();
    }
}
