//! Method names reserved by the protocol engine.
//!
//! Application methods are free-form strings; these are the ones the session
//! and the task engine handle themselves.

use crate::envelope::RequestId;
use serde::{Deserialize, Serialize};

/// Caller abandoned a request: `{requestId, reason?}`.
pub const CANCELLED: &str = "notifications/cancelled";

/// Progress for a pending request: `{progressToken, progress, total?, message?}`.
pub const PROGRESS: &str = "notifications/progress";

/// A task changed status. Params are the task snapshot.
pub const TASK_STATUS: &str = "notifications/tasks/status";

/// Fetch a task snapshot: `{taskId}`.
pub const TASKS_GET: &str = "tasks/get";

/// Fetch a task's stored outcome, long-polling until terminal: `{taskId}`.
pub const TASKS_RESULT: &str = "tasks/result";

/// Page through tasks: `{cursor?}`.
pub const TASKS_LIST: &str = "tasks/list";

/// Cancel a task: `{taskId}`.
pub const TASKS_CANCEL: &str = "tasks/cancel";

/// Params of [`CANCELLED`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelledParams {
    /// Id of the abandoned request, in the sender's id space.
    pub request_id: RequestId,
    /// Optional reason, for logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Params of [`PROGRESS`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressParams {
    /// Token from the request's `_meta.progressToken`.
    pub progress_token: RequestId,
    /// Progress so far. Increases with every notification.
    pub progress: f64,
    /// Total, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<f64>,
    /// Optional human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
