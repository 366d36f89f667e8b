//! Task data model.
//!
//! A task is a durable, pollable unit of work created by a task-augmented
//! request. The receiver answers the request immediately with a
//! [`CreateTaskResult`] and the caller polls `tasks/get` and `tasks/result`
//! until the task reaches a terminal [`TaskStatus`].

use crate::envelope::Envelope;
use crate::error::ErrorObject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `TaskId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid task ID: {0}")]
pub struct ParseTaskIdError(String);

/// Opaque, globally unique task identifier.
///
/// The engine allocates UUID v4 strings; peers treat the value as opaque.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wrap an existing identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Unwrap into the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TaskId {
    type Err = ParseTaskIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseTaskIdError("Task ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle status of a task.
///
/// ```text
/// submitted ─┬─▶ working ◀──▶ input_required
///            │      │               │
///            └──────┴───────┬───────┘
///                           ▼
///          completed | failed | cancelled | unknown
/// ```
///
/// Terminal statuses never change again.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, work not started.
    Submitted,
    /// Work in progress.
    Working,
    /// Waiting for the caller to answer a queued request.
    InputRequired,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before finishing.
    Cancelled,
    /// The receiver lost track of the task.
    Unknown,
}

impl TaskStatus {
    /// Whether the status is final.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Unknown
        )
    }

    /// Whether `self → next` is a legal transition.
    ///
    /// Nothing leaves a terminal status and nothing re-enters `submitted`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        !self.is_terminal() && !matches!(next, Self::Submitted)
    }

    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Working => "working",
            Self::InputRequired => "input_required",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a task as reported to callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Task identifier.
    pub task_id: TaskId,
    /// Current status.
    pub status: TaskStatus,
    /// Optional human-readable detail about the status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_message: Option<String>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub last_updated_at: DateTime<Utc>,
    /// Retention after reaching a terminal status, in milliseconds.
    /// `None` keeps the task until it is deleted explicitly.
    #[serde(default)]
    pub ttl: Option<u64>,
    /// Suggested delay between polls, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<u64>,
}

/// `params.task` of a task-augmented request.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    /// Requested retention in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl TaskMetadata {
    /// Extract `params.task` from request params.
    ///
    /// Returns `Ok(None)` when the request is not task-augmented.
    ///
    /// # Errors
    ///
    /// Returns the deserializer error when `params.task` is malformed.
    pub fn from_params(params: Option<&Value>) -> Result<Option<Self>, serde_json::Error> {
        params
            .and_then(|p| p.get("task"))
            .map(|task| serde_json::from_value(task.clone()))
            .transpose()
    }
}

/// The call that created a task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOrigin {
    /// Method of the task-augmented request.
    pub method: String,
    /// Its params.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Stored result of a terminal task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskOutcome {
    /// The task completed with this value.
    Result(Value),
    /// The task failed with this error.
    Error(ErrorObject),
}

/// Immediate answer to a task-augmented request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTaskResult {
    /// The freshly created task.
    pub task: Task,
}

/// Params of `tasks/get`, `tasks/result` and `tasks/cancel`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskIdParams {
    /// Task being addressed.
    pub task_id: TaskId,
}

/// Params of `tasks/list`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksParams {
    /// Cursor returned by the previous page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// One page of `tasks/list`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksResult {
    /// Tasks in creation order.
    pub tasks: Vec<Task>,
    /// Cursor for the next page, absent on the last page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// A message waiting for the original caller of a task.
#[derive(Clone, Debug, PartialEq)]
pub struct QueuedMessage {
    /// Request or notification to deliver.
    pub message: Envelope,
    /// When it was queued.
    pub enqueued_at: DateTime<Utc>,
}

/// Result of a status change attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The change was applied. Carries the updated snapshot.
    Applied(Task),
    /// The change was illegal and nothing happened.
    Ignored {
        /// Status the task was in.
        current: TaskStatus,
    },
}

impl TransitionOutcome {
    /// Whether the change took effect.
    #[must_use]
    pub const fn is_applied(&self) -> bool {
        matches!(self, Self::Applied(_))
    }
}

/// Errors from task operations.
///
/// None of these end a session: the task methods answer them with an error
/// response and carry on.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// No task with this id.
    #[error("Task not found: {0}")]
    NotFound(TaskId),

    /// The task exists but has no stored result (not terminal, cancelled or
    /// unknown). Reported to peers as task-not-found.
    #[error("Task not found: {0} has no stored result")]
    ResultNotFound(TaskId),

    /// The task outlived its retention.
    #[error("Task expired: {0}")]
    Expired(TaskId),

    /// The pagination cursor was never handed out or cannot be parsed.
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// The backing store failed.
    #[error("Task storage error: {0}")]
    Storage(String),
}
