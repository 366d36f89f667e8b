//! The task engine.

use super::handle::TaskHandle;
use super::store::{InMemoryMessageQueue, InMemoryTaskStore};
use crate::config::TaskEngineConfig;
use crate::metrics::{
    TASK_MESSAGES_QUEUED, TASK_TRANSITIONS, TASK_TRANSITIONS_IGNORED, TASKS_PURGED,
};
use crate::session::{RequestContext, RequestOptions, Session};
use duplex_rpc_core::environment::{Clock, SystemClock};
use duplex_rpc_core::envelope::{Envelope, Notification, Request, RequestId};
use duplex_rpc_core::error::{ErrorObject, HandlerError, RpcError};
use duplex_rpc_core::methods;
use duplex_rpc_core::task::{
    CreateTaskResult, ListTasksResult, QueuedMessage, Task, TaskError, TaskId, TaskMetadata,
    TaskOrigin, TaskOutcome, TaskStatus, TransitionOutcome,
};
use duplex_rpc_core::task_store::{StatusChange, TaskMessageQueue, TaskRecord, TaskStore};
use futures::FutureExt;
use metrics::counter;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;

pub(crate) type ResolverOutcome = Result<Value, RpcError>;

/// In-process bookkeeping for a task the store knows nothing about.
struct LiveTask {
    /// Bumped on every status change and queued message.
    changes: watch::Sender<u64>,
    /// Session of the last caller that attached. Status notifications and
    /// queued messages go there.
    session: Option<Session>,
    work: Option<AbortHandle>,
    /// Serializes deliveries so batches reach the caller in queue order.
    delivery: Arc<tokio::sync::Mutex<()>>,
}

impl LiveTask {
    fn new() -> Self {
        Self {
            changes: watch::channel(0).0,
            session: None,
            work: None,
            delivery: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Waiter for the caller's answer to a queued request.
struct Resolver {
    task_id: TaskId,
    tx: oneshot::Sender<ResolverOutcome>,
}

struct EngineInner {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn TaskMessageQueue>,
    clock: Arc<dyn Clock>,
    config: TaskEngineConfig,
    live: Mutex<HashMap<TaskId, LiveTask>>,
    resolvers: Mutex<HashMap<RequestId, Resolver>>,
    next_seq: AtomicU64,
}

/// Owner of every task operation.
///
/// Wraps a [`TaskStore`], a [`TaskMessageQueue`] and a [`Clock`]. Status
/// changes go through the store's atomic transition, so the first terminal
/// writer wins and later ones are ignored. Cheap to clone.
///
/// # Example
///
/// ```
/// use duplex_rpc_core::task::{TaskOrigin, TaskStatus};
/// use duplex_rpc_runtime::config::TaskEngineConfig;
/// use duplex_rpc_runtime::tasks::TaskEngine;
/// use serde_json::json;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = TaskEngine::in_memory(TaskEngineConfig::default());
/// let origin = TaskOrigin { method: "tools/call".into(), params: None };
/// let task = engine.create_task(None, origin).await?;
/// assert_eq!(task.status, TaskStatus::Submitted);
///
/// engine.complete(&task.task_id, json!({"ok": true})).await?;
/// assert!(engine.get_task(&task.task_id).await?.status.is_terminal());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TaskEngine {
    inner: Arc<EngineInner>,
}

impl TaskEngine {
    /// Engine over the given backends.
    #[must_use]
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn TaskMessageQueue>,
        clock: Arc<dyn Clock>,
        config: TaskEngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                store,
                queue,
                clock,
                config,
                live: Mutex::new(HashMap::new()),
                resolvers: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Engine over fresh in-memory backends and the system clock.
    #[must_use]
    pub fn in_memory(config: TaskEngineConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Engine over fresh in-memory backends and `clock`.
    #[must_use]
    pub fn with_clock(config: TaskEngineConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(InMemoryMessageQueue::new()),
            clock,
            config,
        )
    }

    /// Configuration the engine runs with.
    #[must_use]
    pub fn config(&self) -> &TaskEngineConfig {
        &self.inner.config
    }

    /// Create a task in `submitted`.
    ///
    /// The ttl comes from `metadata` when it names one, otherwise from
    /// [`TaskEngineConfig::default_ttl`].
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if the record cannot be saved.
    pub async fn create_task(
        &self,
        metadata: Option<TaskMetadata>,
        origin: TaskOrigin,
    ) -> Result<Task, TaskError> {
        let config = &self.inner.config;
        let now = self.inner.clock.now();
        let task = Task {
            task_id: TaskId::new(uuid::Uuid::new_v4().to_string()),
            status: TaskStatus::Submitted,
            status_message: None,
            created_at: now,
            last_updated_at: now,
            ttl: metadata
                .and_then(|metadata| metadata.ttl)
                .or_else(|| config.default_ttl.map(millis)),
            poll_interval: Some(millis(config.poll_interval)),
        };
        let method = origin.method.clone();
        self.inner
            .store
            .insert(TaskRecord::new(task.clone(), origin))
            .await?;
        self.live().insert(task.task_id.clone(), LiveTask::new());

        counter!(TASK_TRANSITIONS, "status" => TaskStatus::Submitted.as_str()).increment(1);
        tracing::debug!(task_id = %task.task_id, %method, ttl = ?task.ttl, "Task created");
        Ok(task)
    }

    /// Move a task to `working` or `input_required`.
    ///
    /// Any other target, or a task that is already terminal, is logged and
    /// ignored.
    ///
    /// # Errors
    ///
    /// [`TaskError::NotFound`] for unknown ids, [`TaskError::Storage`] on
    /// backend failure.
    pub async fn update_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        message: Option<String>,
    ) -> Result<TransitionOutcome, TaskError> {
        if !matches!(status, TaskStatus::Working | TaskStatus::InputRequired) {
            let current = self.record(task_id).await?.task.status;
            counter!(TASK_TRANSITIONS_IGNORED).increment(1);
            tracing::warn!(
                %task_id,
                %status,
                "update_status only moves tasks to working or input_required"
            );
            return Ok(TransitionOutcome::Ignored { current });
        }
        self.apply(task_id, status, message, None).await
    }

    /// Complete the task with `result`. No-op if it is already terminal.
    ///
    /// # Errors
    ///
    /// [`TaskError::NotFound`] for unknown ids, [`TaskError::Storage`] on
    /// backend failure.
    pub async fn complete(
        &self,
        task_id: &TaskId,
        result: Value,
    ) -> Result<TransitionOutcome, TaskError> {
        self.apply(
            task_id,
            TaskStatus::Completed,
            None,
            Some(TaskOutcome::Result(result)),
        )
        .await
    }

    /// Fail the task with `error`. No-op if it is already terminal.
    ///
    /// # Errors
    ///
    /// [`TaskError::NotFound`] for unknown ids, [`TaskError::Storage`] on
    /// backend failure.
    pub async fn fail(
        &self,
        task_id: &TaskId,
        error: ErrorObject,
    ) -> Result<TransitionOutcome, TaskError> {
        let message = Some(error.message.clone());
        self.apply(
            task_id,
            TaskStatus::Failed,
            message,
            Some(TaskOutcome::Error(error)),
        )
        .await
    }

    /// Cancel the task. No-op if it is already terminal.
    ///
    /// When applied, the task's work is aborted, its queue dropped and its
    /// unanswered queued requests fail with [`RpcError::Cancelled`].
    ///
    /// # Errors
    ///
    /// [`TaskError::NotFound`] for unknown ids, [`TaskError::Storage`] on
    /// backend failure.
    pub async fn cancel(
        &self,
        task_id: &TaskId,
        reason: Option<String>,
    ) -> Result<TransitionOutcome, TaskError> {
        let outcome = self
            .apply(task_id, TaskStatus::Cancelled, reason, None)
            .await?;
        if outcome.is_applied() {
            let work = self
                .live()
                .get_mut(task_id)
                .and_then(|live| live.work.take());
            if let Some(work) = work {
                work.abort();
            }
            self.fail_resolvers(task_id);
            self.inner.queue.clear(task_id.clone()).await?;
        }
        Ok(outcome)
    }

    /// Current snapshot of a task.
    ///
    /// # Errors
    ///
    /// [`TaskError::NotFound`] for unknown ids, [`TaskError::Expired`] once
    /// the task outlived its ttl.
    pub async fn get_task(&self, task_id: &TaskId) -> Result<Task, TaskError> {
        Ok(self.record(task_id).await?.task)
    }

    /// Stored outcome of a terminal task. Does not consume it.
    ///
    /// # Errors
    ///
    /// [`TaskError::ResultNotFound`] when the task has no stored outcome
    /// (still running, cancelled or unknown status), plus the errors of
    /// [`TaskEngine::get_task`].
    pub async fn get_task_result(&self, task_id: &TaskId) -> Result<TaskOutcome, TaskError> {
        self.record(task_id)
            .await?
            .outcome
            .ok_or_else(|| TaskError::ResultNotFound(task_id.clone()))
    }

    /// One page of tasks in creation order. Expired tasks are purged first.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidCursor`] if `cursor` was not handed out by this engine.
    pub async fn list_tasks(&self, cursor: Option<String>) -> Result<ListTasksResult, TaskError> {
        self.purge_expired().await?;
        let page = self
            .inner
            .store
            .list(cursor, self.inner.config.page_size)
            .await?;
        Ok(ListTasksResult {
            tasks: page.records.into_iter().map(|record| record.task).collect(),
            next_cursor: page.next_cursor,
        })
    }

    /// Queue `message` for the task's caller.
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if the queue fails.
    pub async fn enqueue(&self, task_id: &TaskId, message: Envelope) -> Result<(), TaskError> {
        let queued = QueuedMessage {
            message,
            enqueued_at: self.inner.clock.now(),
        };
        self.inner.queue.enqueue(task_id.clone(), queued).await?;
        counter!(TASK_MESSAGES_QUEUED).increment(1);
        self.notify_change(task_id);
        Ok(())
    }

    /// Take every queued message for the task, oldest first.
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if the queue fails.
    pub async fn drain(&self, task_id: &TaskId) -> Result<Vec<QueuedMessage>, TaskError> {
        self.inner.queue.drain(task_id.clone()).await
    }

    /// Number of messages waiting for the task's caller.
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if the queue fails.
    pub async fn pending_messages(&self, task_id: &TaskId) -> Result<usize, TaskError> {
        self.inner.queue.pending_count(task_id.clone()).await
    }

    /// Subscribe to changes of one task. Subscribe before reading the state
    /// you wait on so no change is missed.
    #[must_use]
    pub fn watch(&self, task_id: &TaskId) -> TaskWatcher {
        let rx = self
            .live()
            .entry(task_id.clone())
            .or_insert_with(LiveTask::new)
            .changes
            .subscribe();
        TaskWatcher { rx }
    }

    /// Wait until the task's status changes or a message is queued for it.
    /// Returns `false` on timeout.
    pub async fn wait_for_change(&self, task_id: &TaskId, timeout: Duration) -> bool {
        self.watch(task_id).changed(timeout).await
    }

    /// Delete every task whose ttl ran out and return their ids.
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if a backend fails.
    pub async fn purge_expired(&self) -> Result<Vec<TaskId>, TaskError> {
        let removed = self
            .inner
            .store
            .remove_expired(self.inner.clock.now())
            .await?;
        for task_id in &removed {
            self.inner.queue.clear(task_id.clone()).await?;
            if let Some(live) = self.live().remove(task_id) {
                if let Some(work) = live.work {
                    work.abort();
                }
            }
            self.fail_resolvers(task_id);
        }
        if !removed.is_empty() {
            counter!(TASKS_PURGED).increment(u64::try_from(removed.len()).unwrap_or(u64::MAX));
            tracing::debug!(count = removed.len(), "Purged expired tasks");
        }
        Ok(removed)
    }

    /// Run [`TaskEngine::purge_expired`] every `interval` until the returned
    /// handle is aborted.
    #[must_use]
    pub fn spawn_reaper(&self, interval: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(error) = engine.purge_expired().await {
                    tracing::warn!(%error, "Task reaper failed");
                }
            }
        })
    }

    /// Route status notifications and queued messages of the task to
    /// `session` from now on.
    pub fn attach(&self, task_id: &TaskId, session: &Session) {
        self.live()
            .entry(task_id.clone())
            .or_insert_with(LiveTask::new)
            .session = Some(session.clone());
    }

    /// Send the task's queued messages through `session` in FIFO order and
    /// return once the drained batch is out.
    ///
    /// Queued requests are re-issued with a fresh outbound id and their
    /// answers resume the waiting work, so this also waits for those
    /// answers. When the session closes mid-delivery, the undelivered
    /// messages go back to the queue for the next attach.
    pub async fn deliver_pending(&self, task_id: &TaskId, session: &Session) {
        let lock = Arc::clone(
            &self
                .live()
                .entry(task_id.clone())
                .or_insert_with(LiveTask::new)
                .delivery,
        );
        let _delivering = lock.lock().await;
        let messages = match self.drain(task_id).await {
            Ok(messages) => messages,
            Err(error) => {
                tracing::warn!(%task_id, %error, "Could not drain task queue");
                return;
            }
        };
        if messages.is_empty() {
            return;
        }
        tracing::debug!(%task_id, count = messages.len(), "Delivering queued task messages");

        let mut messages = messages.into_iter();
        while let Some(QueuedMessage { message, enqueued_at }) = messages.next() {
            let Some(message) = self.deliver_one(session, message).await else {
                continue;
            };
            let undelivered =
                std::iter::once(QueuedMessage { message, enqueued_at }).chain(messages);
            for queued in undelivered {
                if let Err(error) = self.inner.queue.enqueue(task_id.clone(), queued).await {
                    tracing::warn!(%task_id, %error, "Lost a queued task message");
                }
            }
            tracing::debug!(%task_id, "Caller went away; requeued undelivered messages");
            break;
        }
    }

    /// [`TaskEngine::deliver_pending`] in the background.
    pub fn deliver_queued(&self, task_id: &TaskId, session: &Session) {
        let engine = self.clone();
        let task_id = task_id.clone();
        let session = session.clone();
        tokio::spawn(async move { engine.deliver_pending(&task_id, &session).await });
    }

    /// Create a task for the request in `cx`, spawn `work` for it and return
    /// the `CreateTaskResult` to answer the request with.
    ///
    /// `work` returning `Ok(value)` completes the task and `Err(error)` fails
    /// it, unless the task already reached a terminal status. A panic fails
    /// the task with an internal error. The work keeps running when the
    /// caller's session ends.
    ///
    /// # Errors
    ///
    /// [`HandlerError::Internal`] if the task cannot be stored.
    pub async fn run_task<F, Fut>(
        &self,
        cx: &RequestContext,
        metadata: Option<TaskMetadata>,
        work: F,
    ) -> Result<Value, HandlerError>
    where
        F: FnOnce(TaskHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let origin = TaskOrigin {
            method: cx.method().to_string(),
            params: cx.raw_params().cloned(),
        };
        let task = self.create_task(metadata, origin).await?;
        let task_id = task.task_id.clone();
        self.attach(&task_id, cx.session());

        let handle = TaskHandle::new(self.clone(), task_id.clone());
        let engine = self.clone();
        let id = task_id.clone();
        let join = tokio::spawn(async move {
            let outcome = AssertUnwindSafe(async move { work(handle).await })
                .catch_unwind()
                .await;
            let settled = match outcome {
                Ok(Ok(value)) => engine.complete(&id, value).await,
                Ok(Err(error)) => engine.fail(&id, error.into_error_object()).await,
                Err(_) => {
                    tracing::error!(task_id = %id, "Task work panicked");
                    engine
                        .fail(&id, ErrorObject::internal_error("Task work panicked"))
                        .await
                }
            };
            if let Err(error) = settled {
                tracing::warn!(task_id = %id, %error, "Could not record task outcome");
            }
            if let Some(live) = engine.live().get_mut(&id) {
                live.work = None;
            }
        });
        if let Some(live) = self.live().get_mut(&task_id) {
            if !join.is_finished() {
                live.work = Some(join.abort_handle());
            }
        }

        serde_json::to_value(CreateTaskResult { task })
            .map_err(|e| HandlerError::internal(e.to_string()))
    }

    /// Queue a request for the caller and return the receiver of its answer.
    pub(crate) async fn enqueue_request(
        &self,
        task_id: &TaskId,
        method: &str,
        params: Option<Value>,
    ) -> Result<oneshot::Receiver<ResolverOutcome>, TaskError> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = RequestId::String(format!("{task_id}:{seq}"));
        let (tx, rx) = oneshot::channel();
        self.resolvers().insert(
            id.clone(),
            Resolver {
                task_id: task_id.clone(),
                tx,
            },
        );
        if let Err(error) = self
            .enqueue(task_id, Envelope::request(id.clone(), method, params))
            .await
        {
            self.resolvers().remove(&id);
            return Err(error);
        }
        Ok(rx)
    }

    /// Deliver one message. Returns it back when the session is gone.
    async fn deliver_one(&self, session: &Session, message: Envelope) -> Option<Envelope> {
        match message {
            Envelope::Notification(Notification { method, params }) => {
                if session.is_closed() {
                    return Some(Envelope::notification(method, params));
                }
                session.send_notification(&method, params).await;
                None
            }
            Envelope::Request(Request { id, method, params }) => {
                let outcome = session
                    .send_request(&method, params.clone(), RequestOptions::default())
                    .await;
                if matches!(outcome, Err(RpcError::ConnectionClosed)) {
                    return Some(Envelope::request(id, method, params));
                }
                self.resolve(&id, outcome);
                None
            }
            response => {
                tracing::debug!(kind = response.kind(), "Dropping queued response envelope");
                None
            }
        }
    }

    fn resolve(&self, id: &RequestId, outcome: ResolverOutcome) {
        match self.resolvers().remove(id) {
            Some(resolver) => {
                let _ = resolver.tx.send(outcome);
            }
            None => {
                tracing::debug!(request_id = %id, "Answer for a queued request nobody waits on");
            }
        }
    }

    fn fail_resolvers(&self, task_id: &TaskId) {
        let failed: Vec<(RequestId, Resolver)> = {
            let mut resolvers = self.resolvers();
            let ids: Vec<RequestId> = resolvers
                .iter()
                .filter(|(_, resolver)| &resolver.task_id == task_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| resolvers.remove(&id).map(|resolver| (id, resolver)))
                .collect()
        };
        for (id, resolver) in failed {
            let _ = resolver.tx.send(Err(RpcError::Cancelled(id)));
        }
    }

    async fn record(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        let record = self
            .inner
            .store
            .get(task_id.clone())
            .await?
            .ok_or_else(|| TaskError::NotFound(task_id.clone()))?;
        if record.is_expired(self.inner.clock.now()) {
            return Err(TaskError::Expired(task_id.clone()));
        }
        Ok(record)
    }

    async fn apply(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
        message: Option<String>,
        outcome: Option<TaskOutcome>,
    ) -> Result<TransitionOutcome, TaskError> {
        let change = StatusChange {
            status,
            message,
            outcome,
            at: self.inner.clock.now(),
        };
        let result = self.inner.store.transition(task_id.clone(), change).await?;
        match &result {
            TransitionOutcome::Applied(task) => {
                counter!(TASK_TRANSITIONS, "status" => status.as_str()).increment(1);
                tracing::debug!(%task_id, %status, "Task status changed");
                self.notify_change(task_id);
                self.push_status(task).await;
            }
            TransitionOutcome::Ignored { current } => {
                counter!(TASK_TRANSITIONS_IGNORED).increment(1);
                tracing::debug!(
                    %task_id,
                    from = %current,
                    to = %status,
                    "Ignoring task status change"
                );
            }
        }
        Ok(result)
    }

    async fn push_status(&self, task: &Task) {
        let session = self
            .live()
            .get(&task.task_id)
            .and_then(|live| live.session.clone());
        let Some(session) = session.filter(|session| !session.is_closed()) else {
            return;
        };
        match serde_json::to_value(task) {
            Ok(params) => {
                session
                    .send_notification(methods::TASK_STATUS, Some(params))
                    .await;
            }
            Err(error) => {
                tracing::warn!(task_id = %task.task_id, %error, "Failed to encode task status");
            }
        }
    }

    fn notify_change(&self, task_id: &TaskId) {
        if let Some(live) = self.live().get(task_id) {
            live.changes.send_modify(|version| *version = version.wrapping_add(1));
        }
    }

    fn live(&self) -> MutexGuard<'_, HashMap<TaskId, LiveTask>> {
        self.inner.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolvers(&self) -> MutexGuard<'_, HashMap<RequestId, Resolver>> {
        self.inner.resolvers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for TaskEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEngine")
            .field("config", &self.inner.config)
            .field("live_tasks", &self.live().len())
            .finish_non_exhaustive()
    }
}

/// Change subscription for one task, from [`TaskEngine::watch`].
#[derive(Debug)]
pub struct TaskWatcher {
    rx: watch::Receiver<u64>,
}

impl TaskWatcher {
    /// Wait for the next change. Returns `false` on timeout or when the task
    /// was purged.
    pub async fn changed(&mut self, timeout: Duration) -> bool {
        matches!(tokio::time::timeout(timeout, self.rx.changed()).await, Ok(Ok(())))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone, Utc};
    use duplex_rpc_testing::ManualClock;
    use serde_json::json;

    fn origin() -> TaskOrigin {
        TaskOrigin {
            method: "tools/call".into(),
            params: Some(json!({"name": "slow"})),
        }
    }

    fn engine_at(clock: &Arc<ManualClock>) -> TaskEngine {
        TaskEngine::with_clock(
            TaskEngineConfig::default()
                .with_default_ttl(Some(Duration::from_secs(60)))
                .with_page_size(2),
            Arc::clone(clock) as Arc<dyn Clock>,
        )
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()))
    }

    #[tokio::test]
    async fn created_tasks_use_config_defaults() {
        let engine = engine_at(&clock());
        let task = engine.create_task(None, origin()).await.unwrap();
        assert_eq!(task.status, TaskStatus::Submitted);
        assert_eq!(task.ttl, Some(60_000));
        assert_eq!(task.poll_interval, Some(500));
        assert!(uuid::Uuid::parse_str(task.task_id.as_str()).is_ok());

        let custom = engine
            .create_task(Some(TaskMetadata { ttl: Some(5) }), origin())
            .await
            .unwrap();
        assert_eq!(custom.ttl, Some(5));
    }

    #[tokio::test]
    async fn update_status_refuses_terminal_targets() {
        let engine = engine_at(&clock());
        let task = engine.create_task(None, origin()).await.unwrap();
        let outcome = engine
            .update_status(&task.task_id, TaskStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransitionOutcome::Ignored {
                current: TaskStatus::Submitted
            }
        );
        assert!(engine.get_task_result(&task.task_id).await.is_err());
    }

    #[tokio::test]
    async fn terminal_statuses_stick() {
        let engine = engine_at(&clock());
        let task = engine.create_task(None, origin()).await.unwrap();
        let id = &task.task_id;

        assert!(engine.fail(id, ErrorObject::internal_error("boom")).await.unwrap().is_applied());
        assert!(!engine.complete(id, json!(1)).await.unwrap().is_applied());
        assert!(!engine.cancel(id, None).await.unwrap().is_applied());
        assert!(
            !engine
                .update_status(id, TaskStatus::Working, None)
                .await
                .unwrap()
                .is_applied()
        );

        let snapshot = engine.get_task(id).await.unwrap();
        assert_eq!(snapshot.status, TaskStatus::Failed);
        assert_eq!(snapshot.status_message.as_deref(), Some("boom"));
        assert_eq!(
            engine.get_task_result(id).await.unwrap(),
            TaskOutcome::Error(ErrorObject::internal_error("boom"))
        );
    }

    #[tokio::test]
    async fn cancelled_tasks_have_no_result() {
        let engine = engine_at(&clock());
        let task = engine.create_task(None, origin()).await.unwrap();
        engine.cancel(&task.task_id, Some("user".into())).await.unwrap();
        assert_eq!(
            engine.get_task_result(&task.task_id).await.unwrap_err(),
            TaskError::ResultNotFound(task.task_id.clone())
        );
    }

    #[tokio::test]
    async fn expired_tasks_report_expired_then_vanish() {
        let clock = clock();
        let engine = engine_at(&clock);
        let task = engine.create_task(None, origin()).await.unwrap();
        engine.complete(&task.task_id, json!("done")).await.unwrap();

        clock.advance(TimeDelta::seconds(59));
        assert!(engine.get_task(&task.task_id).await.is_ok());

        clock.advance(TimeDelta::seconds(1));
        assert_eq!(
            engine.get_task(&task.task_id).await.unwrap_err(),
            TaskError::Expired(task.task_id.clone())
        );

        assert_eq!(engine.purge_expired().await.unwrap(), vec![task.task_id.clone()]);
        assert_eq!(
            engine.get_task(&task.task_id).await.unwrap_err(),
            TaskError::NotFound(task.task_id.clone())
        );
    }

    #[tokio::test]
    async fn list_pages_with_config_page_size() {
        let engine = engine_at(&clock());
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(engine.create_task(None, origin()).await.unwrap().task_id);
        }

        let first = engine.list_tasks(None).await.unwrap();
        assert_eq!(first.tasks.len(), 2);
        let second = engine.list_tasks(first.next_cursor.clone()).await.unwrap();
        let listed: Vec<_> = first
            .tasks
            .iter()
            .chain(&second.tasks)
            .map(|task| task.task_id.clone())
            .collect();
        assert_eq!(listed, ids);
        assert_eq!(second.next_cursor, None);

        assert!(matches!(
            engine.list_tasks(Some("bogus".into())).await,
            Err(TaskError::InvalidCursor(_))
        ));
    }

    #[tokio::test]
    async fn cursor_survives_expiry_of_its_last_task() {
        let clock = clock();
        let engine = engine_at(&clock);
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(engine.create_task(None, origin()).await.unwrap().task_id);
        }
        let first = engine.list_tasks(None).await.unwrap();
        let cursor = first.next_cursor.expect("second page");

        // The page ended on the second task; it finishes and expires.
        engine.complete(&ids[1], json!("done")).await.unwrap();
        clock.advance(TimeDelta::seconds(61));

        let second = engine.list_tasks(Some(cursor)).await.unwrap();
        let listed: Vec<_> = second.tasks.iter().map(|task| task.task_id.clone()).collect();
        assert_eq!(listed, vec![ids[2].clone()]);
        assert_eq!(
            engine.get_task(&ids[1]).await.unwrap_err(),
            TaskError::NotFound(ids[1].clone())
        );
    }

    #[tokio::test]
    async fn watchers_see_status_changes_and_queued_messages() {
        let engine = engine_at(&clock());
        let task = engine.create_task(None, origin()).await.unwrap();

        let mut watcher = engine.watch(&task.task_id);
        assert!(!watcher.changed(Duration::from_millis(10)).await);

        engine
            .enqueue(&task.task_id, Envelope::notification("log", None))
            .await
            .unwrap();
        assert!(watcher.changed(Duration::from_secs(1)).await);

        engine
            .update_status(&task.task_id, TaskStatus::Working, None)
            .await
            .unwrap();
        assert!(watcher.changed(Duration::from_secs(1)).await);
        assert_eq!(engine.pending_messages(&task.task_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_fails_waiting_queued_requests() {
        let engine = engine_at(&clock());
        let task = engine.create_task(None, origin()).await.unwrap();
        let rx = engine
            .enqueue_request(&task.task_id, "confirm", None)
            .await
            .unwrap();

        let queued = engine.pending_messages(&task.task_id).await.unwrap();
        assert_eq!(queued, 1);

        engine.cancel(&task.task_id, None).await.unwrap();
        assert!(matches!(rx.await.unwrap(), Err(RpcError::Cancelled(_))));
        assert_eq!(engine.pending_messages(&task.task_id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queued_request_ids_are_task_local() {
        let engine = engine_at(&clock());
        let task = engine.create_task(None, origin()).await.unwrap();
        let _rx = engine
            .enqueue_request(&task.task_id, "confirm", Some(json!({"q": 1})))
            .await
            .unwrap();
        let drained = engine.drain(&task.task_id).await.unwrap();
        let id = drained[0].message.id().cloned().unwrap();
        assert_eq!(id, RequestId::String(format!("{}:0", task.task_id)));
    }
}
