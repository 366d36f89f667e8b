//! Persistence contracts for the task engine.
//!
//! [`TaskStore`] keeps task records and applies status changes atomically.
//! [`TaskMessageQueue`] holds the messages a task wants to send back to its
//! original caller until the caller attaches again.
//!
//! Both traits return boxed futures so they stay dyn-compatible and the engine
//! can hold `Arc<dyn TaskStore>`. Policy (expiry, default ttl, page size) lives
//! in the engine; stores only persist and check transition legality.
//!
//! # Implementations
//!
//! - `InMemoryTaskStore` and `InMemoryMessageQueue` in `duplex-rpc-runtime`.

use crate::task::{
    QueuedMessage, Task, TaskError, TaskId, TaskOrigin, TaskOutcome, TaskStatus, TransitionOutcome,
};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by store and queue operations.
pub type TaskFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, TaskError>> + Send + 'a>>;

/// Everything a store keeps about one task.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskRecord {
    /// Current snapshot.
    pub task: Task,
    /// The request that created the task.
    pub origin: TaskOrigin,
    /// Stored result or error, once terminal.
    pub outcome: Option<TaskOutcome>,
    /// When the task becomes eligible for deletion. Set on entering a
    /// terminal status when the task has a ttl.
    pub expires_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    /// Record for a freshly created task.
    #[must_use]
    pub const fn new(task: Task, origin: TaskOrigin) -> Self {
        Self {
            task,
            origin,
            outcome: None,
            expires_at: None,
        }
    }

    /// Whether the record outlived its retention at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// A requested status change.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusChange {
    /// Target status.
    pub status: TaskStatus,
    /// New status message; `None` clears it.
    pub message: Option<String>,
    /// Outcome to store alongside a terminal status.
    pub outcome: Option<TaskOutcome>,
    /// Timestamp of the change.
    pub at: DateTime<Utc>,
}

/// One page of records in creation order.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskPage {
    /// Records on this page.
    pub records: Vec<TaskRecord>,
    /// Cursor for the next page.
    pub next_cursor: Option<String>,
}

/// Durable storage for task records.
///
/// # Atomicity
///
/// [`TaskStore::transition`] must check legality and apply the change as one
/// step: of two concurrent terminal transitions exactly one is applied.
pub trait TaskStore: Send + Sync {
    /// Insert a new record.
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if the record cannot be saved.
    fn insert(&self, record: TaskRecord) -> TaskFuture<'_, ()>;

    /// Fetch a record, `None` if unknown.
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if the backend fails.
    fn get(&self, task_id: TaskId) -> TaskFuture<'_, Option<TaskRecord>>;

    /// Apply `change` if `current.can_transition_to(change.status)`.
    ///
    /// Entering a terminal status stamps `expires_at = at + ttl`.
    ///
    /// # Errors
    ///
    /// [`TaskError::NotFound`] for unknown ids, [`TaskError::Storage`] on
    /// backend failure. Illegal transitions are not errors.
    fn transition(
        &self,
        task_id: TaskId,
        change: StatusChange,
    ) -> TaskFuture<'_, TransitionOutcome>;

    /// List up to `limit` records after `cursor`, in creation order.
    ///
    /// # Errors
    ///
    /// [`TaskError::InvalidCursor`] if the cursor names no stored task.
    fn list(&self, cursor: Option<String>, limit: usize) -> TaskFuture<'_, TaskPage>;

    /// Remove a record. Returns whether it existed.
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if the backend fails.
    fn remove(&self, task_id: TaskId) -> TaskFuture<'_, bool>;

    /// Remove every record expired at `now` and return their ids.
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if the backend fails.
    fn remove_expired(&self, now: DateTime<Utc>) -> TaskFuture<'_, Vec<TaskId>>;
}

/// FIFO per-task queue of messages for the original caller.
pub trait TaskMessageQueue: Send + Sync {
    /// Append a message to the task's queue.
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if the backend fails.
    fn enqueue(&self, task_id: TaskId, message: QueuedMessage) -> TaskFuture<'_, ()>;

    /// Remove and return every queued message in arrival order.
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if the backend fails.
    fn drain(&self, task_id: TaskId) -> TaskFuture<'_, Vec<QueuedMessage>>;

    /// Number of queued messages.
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if the backend fails.
    fn pending_count(&self, task_id: TaskId) -> TaskFuture<'_, usize>;

    /// Drop the task's queue entirely.
    ///
    /// # Errors
    ///
    /// [`TaskError::Storage`] if the backend fails.
    fn clear(&self, task_id: TaskId) -> TaskFuture<'_, ()>;
}
