//! What task work gets to act on its own task.

use super::TaskEngine;
use duplex_rpc_core::envelope::Envelope;
use duplex_rpc_core::error::{ErrorObject, HandlerError, RpcError};
use duplex_rpc_core::task::{TaskError, TaskId, TaskStatus, TransitionOutcome};
use serde_json::Value;

/// Handle given to the work spawned by
/// [`TaskEngine::run_task`](super::TaskEngine::run_task).
///
/// The original caller may be gone while the work runs, so everything meant
/// for the caller goes through the task's message queue and is delivered
/// the next time the caller attaches with `tasks/get` or `tasks/result`.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    engine: TaskEngine,
    task_id: TaskId,
}

impl TaskHandle {
    pub(crate) const fn new(engine: TaskEngine, task_id: TaskId) -> Self {
        Self { engine, task_id }
    }

    /// Id of the task.
    #[must_use]
    pub const fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Engine the task lives in.
    #[must_use]
    pub const fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    /// Mark the task `working`.
    ///
    /// # Errors
    ///
    /// Propagates [`TaskEngine::update_status`] errors.
    pub async fn set_working(
        &self,
        message: Option<String>,
    ) -> Result<TransitionOutcome, TaskError> {
        self.engine
            .update_status(&self.task_id, TaskStatus::Working, message)
            .await
    }

    /// Mark the task `input_required`.
    ///
    /// # Errors
    ///
    /// Propagates [`TaskEngine::update_status`] errors.
    pub async fn input_required(
        &self,
        message: Option<String>,
    ) -> Result<TransitionOutcome, TaskError> {
        self.engine
            .update_status(&self.task_id, TaskStatus::InputRequired, message)
            .await
    }

    /// Ask the original caller something and wait for the answer.
    ///
    /// The task sits in `input_required` while the request is queued and
    /// goes back to `working` once the answer arrives.
    ///
    /// # Errors
    ///
    /// The caller's error response as [`HandlerError::Rpc`], a
    /// [`RpcError::Cancelled`] mapping when the task is cancelled while
    /// waiting, or the queue's storage error.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, HandlerError> {
        self.input_required(Some(format!("Waiting for {method}")))
            .await?;
        let rx = self
            .engine
            .enqueue_request(&self.task_id, method, params)
            .await?;
        let answer = rx.await.unwrap_or(Err(RpcError::ConnectionClosed))?;
        self.set_working(None).await?;
        Ok(answer)
    }

    /// Queue a notification for the original caller.
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if the queue fails.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TaskError> {
        self.engine
            .enqueue(&self.task_id, Envelope::notification(method, params))
            .await
    }

    /// Complete the task now. Later outcomes, including the work's own
    /// return value, are ignored.
    ///
    /// # Errors
    ///
    /// Propagates [`TaskEngine::complete`] errors.
    pub async fn complete(&self, result: Value) -> Result<TransitionOutcome, TaskError> {
        self.engine.complete(&self.task_id, result).await
    }

    /// Fail the task now. Later outcomes are ignored.
    ///
    /// # Errors
    ///
    /// Propagates [`TaskEngine::fail`] errors.
    pub async fn fail(&self, error: ErrorObject) -> Result<TransitionOutcome, TaskError> {
        self.engine.fail(&self.task_id, error).await
    }
}
