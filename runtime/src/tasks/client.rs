//! Caller-side helpers for task-augmented requests.

use crate::session::Session;
use duplex_rpc_core::error::RpcError;
use duplex_rpc_core::methods;
use duplex_rpc_core::task::{
    CreateTaskResult, ListTasksParams, ListTasksResult, Task, TaskId, TaskIdParams, TaskMetadata,
};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::time::Duration;

/// Poll delay when the server does not suggest one.
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Typed wrapper over the `tasks/*` methods of a peer.
///
/// # Example
///
/// ```no_run
/// use duplex_rpc_core::task::TaskMetadata;
/// use duplex_rpc_runtime::session::Session;
/// use duplex_rpc_runtime::tasks::TaskClient;
/// use serde_json::{Value, json};
///
/// # async fn example(session: Session) -> Result<(), Box<dyn std::error::Error>> {
/// let client = TaskClient::new(session);
/// let task = client
///     .start("tools/call", json!({"name": "slow"}), TaskMetadata { ttl: Some(60_000) })
///     .await?;
/// client.poll_until_terminal(&task.task_id).await?;
/// let result: Value = client.get_task_result(&task.task_id).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct TaskClient {
    session: Session,
}

impl TaskClient {
    /// Client sending through `session`.
    #[must_use]
    pub const fn new(session: Session) -> Self {
        Self { session }
    }

    /// Session the client sends through.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Send `method` as a task-augmented request and return the created task.
    ///
    /// `params` must be an object or null; `metadata` is added as
    /// `params.task`.
    ///
    /// # Errors
    ///
    /// Errors of [`Session::send_request`], [`RpcError::Serialization`] if
    /// `params` is not an object and [`RpcError::InvalidResult`] if the
    /// answer is not a `CreateTaskResult`.
    pub async fn start(
        &self,
        method: &str,
        params: Value,
        metadata: TaskMetadata,
    ) -> Result<Task, RpcError> {
        let mut params = match params {
            Value::Null => Map::new(),
            Value::Object(map) => map,
            other => {
                return Err(RpcError::Serialization(format!(
                    "task-augmented params must be an object, got {other}"
                )));
            }
        };
        let metadata = serde_json::to_value(metadata)
            .map_err(|e| RpcError::Serialization(e.to_string()))?;
        params.insert("task".to_string(), metadata);
        let created: CreateTaskResult = self.session.request(method, &Value::Object(params)).await?;
        Ok(created.task)
    }

    /// `tasks/get`.
    ///
    /// # Errors
    ///
    /// Errors of [`Session::request`].
    pub async fn get_task(&self, task_id: &TaskId) -> Result<Task, RpcError> {
        self.session
            .request(methods::TASKS_GET, &task_params(task_id))
            .await
    }

    /// `tasks/result`, deserialized into `T`. A failed task answers with its
    /// stored error as [`RpcError::Remote`].
    ///
    /// # Errors
    ///
    /// Errors of [`Session::request`].
    pub async fn get_task_result<T: DeserializeOwned>(
        &self,
        task_id: &TaskId,
    ) -> Result<T, RpcError> {
        self.session
            .request(methods::TASKS_RESULT, &task_params(task_id))
            .await
    }

    /// `tasks/list`.
    ///
    /// # Errors
    ///
    /// Errors of [`Session::request`].
    pub async fn list_tasks(&self, cursor: Option<String>) -> Result<ListTasksResult, RpcError> {
        self.session
            .request(methods::TASKS_LIST, &ListTasksParams { cursor })
            .await
    }

    /// `tasks/cancel`. Returns the task as it stands afterwards.
    ///
    /// # Errors
    ///
    /// Errors of [`Session::request`].
    pub async fn cancel_task(&self, task_id: &TaskId) -> Result<Task, RpcError> {
        self.session
            .request(methods::TASKS_CANCEL, &task_params(task_id))
            .await
    }

    /// Poll `tasks/get` until the task is terminal, sleeping the task's
    /// `pollInterval` between polls.
    ///
    /// Each poll attaches, so queued requests from the task reach this
    /// session while polling.
    ///
    /// # Errors
    ///
    /// The first error of [`TaskClient::get_task`].
    pub async fn poll_until_terminal(&self, task_id: &TaskId) -> Result<Task, RpcError> {
        loop {
            let task = self.get_task(task_id).await?;
            if task.status.is_terminal() {
                return Ok(task);
            }
            let interval = task
                .poll_interval
                .map_or(DEFAULT_POLL_INTERVAL, Duration::from_millis);
            tracing::trace!(%task_id, status = %task.status, ?interval, "Task not finished yet");
            tokio::time::sleep(interval).await;
        }
    }
}

fn task_params(task_id: &TaskId) -> TaskIdParams {
    TaskIdParams {
        task_id: task_id.clone(),
    }
}
