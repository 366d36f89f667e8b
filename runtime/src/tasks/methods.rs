//! `tasks/*` request handlers.

use super::TaskEngine;
use crate::session::{HandlerRegistry, RequestContext};
use duplex_rpc_core::error::HandlerError;
use duplex_rpc_core::methods;
use duplex_rpc_core::task::{ListTasksParams, TaskIdParams, TaskOutcome};
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

/// Install `tasks/get`, `tasks/result`, `tasks/list` and `tasks/cancel`
/// backed by `engine`.
///
/// `tasks/get` and `tasks/result` attach the caller: the task's status
/// notifications go to the caller's session from then on and its queued
/// messages are delivered through it.
///
/// # Example
///
/// ```
/// use duplex_rpc_runtime::config::TaskEngineConfig;
/// use duplex_rpc_runtime::session::HandlerRegistry;
/// use duplex_rpc_runtime::tasks::{TaskEngine, register_task_methods};
///
/// let engine = TaskEngine::in_memory(TaskEngineConfig::default());
/// let mut registry = HandlerRegistry::new();
/// register_task_methods(&mut registry, &engine);
/// assert!(registry.contains("tasks/result"));
/// ```
pub fn register_task_methods(registry: &mut HandlerRegistry, engine: &TaskEngine) {
    let get = engine.clone();
    let result = engine.clone();
    let list = engine.clone();
    let cancel = engine.clone();
    registry
        .on_request(methods::TASKS_GET, move |cx| {
            let engine = get.clone();
            async move { tasks_get(&engine, &cx).await }
        })
        .on_request(methods::TASKS_RESULT, move |cx| {
            let engine = result.clone();
            async move { tasks_result(&engine, &cx).await }
        })
        .on_request(methods::TASKS_LIST, move |cx| {
            let engine = list.clone();
            async move { tasks_list(&engine, &cx).await }
        })
        .on_request(methods::TASKS_CANCEL, move |cx| {
            let engine = cancel.clone();
            async move { tasks_cancel(&engine, &cx).await }
        });
}

fn to_result<T: Serialize>(value: &T) -> Result<Value, HandlerError> {
    serde_json::to_value(value).map_err(|e| HandlerError::internal(e.to_string()))
}

async fn tasks_get(engine: &TaskEngine, cx: &RequestContext) -> Result<Value, HandlerError> {
    let TaskIdParams { task_id } = cx.params()?;
    let task = engine.get_task(&task_id).await?;
    engine.attach(&task_id, cx.session());
    engine.deliver_queued(&task_id, cx.session());
    to_result(&task)
}

/// Wait up to `result_wait` for a terminal status, delivering queued
/// messages while waiting, then answer with the stored outcome.
///
/// Everything the task queued before it finished reaches the caller ahead
/// of the answer.
async fn tasks_result(engine: &TaskEngine, cx: &RequestContext) -> Result<Value, HandlerError> {
    let TaskIdParams { task_id } = cx.params()?;
    engine.get_task(&task_id).await?;
    engine.attach(&task_id, cx.session());

    let deadline = Instant::now() + engine.config().result_wait;
    let mut watcher = engine.watch(&task_id);
    loop {
        // Status first: messages queued before a terminal status are then
        // already in the queue being drained.
        let task = engine.get_task(&task_id).await?;
        engine.deliver_pending(&task_id, cx.session()).await;
        if task.status.is_terminal() {
            break;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() || !watcher.changed(remaining).await {
            tracing::debug!(%task_id, "Task still running after result wait");
            break;
        }
    }

    match engine.get_task_result(&task_id).await? {
        TaskOutcome::Result(value) => Ok(value),
        TaskOutcome::Error(error) => Err(HandlerError::Rpc(error)),
    }
}

async fn tasks_list(engine: &TaskEngine, cx: &RequestContext) -> Result<Value, HandlerError> {
    let ListTasksParams { cursor } = cx.params()?;
    to_result(&engine.list_tasks(cursor).await?)
}

async fn tasks_cancel(engine: &TaskEngine, cx: &RequestContext) -> Result<Value, HandlerError> {
    let TaskIdParams { task_id } = cx.params()?;
    engine
        .cancel(&task_id, Some("Cancelled by caller".to_string()))
        .await?;
    to_result(&engine.get_task(&task_id).await?)
}
