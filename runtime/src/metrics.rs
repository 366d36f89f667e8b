//! Metric names and descriptions.
//!
//! The runtime records through the [`metrics`] facade; install any recorder
//! (Prometheus, statsd, a test recorder) to collect them. Call
//! [`describe_metrics`] once after installing the recorder to attach
//! descriptions.

use metrics::{describe_counter, describe_gauge, describe_histogram};

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Outbound requests written.
pub const REQUESTS_SENT: &str = "duplex_rpc_requests_sent_total";
/// Inbound requests dispatched to a handler.
pub const REQUESTS_RECEIVED: &str = "duplex_rpc_requests_received_total";
/// Outbound requests that hit their deadline.
pub const REQUEST_TIMEOUTS: &str = "duplex_rpc_request_timeouts_total";
/// Requests cancelled, either direction.
pub const REQUEST_CANCELLATIONS: &str = "duplex_rpc_request_cancellations_total";
/// Responses that matched no pending request.
pub const LATE_RESPONSES: &str = "duplex_rpc_late_responses_total";
/// Round trip of outbound requests.
pub const REQUEST_DURATION: &str = "duplex_rpc_request_duration_seconds";
/// Outbound requests currently awaiting a response.
pub const PENDING_REQUESTS: &str = "duplex_rpc_pending_requests";
/// Inbound requests currently being handled.
pub const INBOUND_CALLS: &str = "duplex_rpc_inbound_calls";
/// Handlers that panicked.
pub const HANDLER_PANICS: &str = "duplex_rpc_handler_panics_total";
/// Inbound messages rejected as invalid.
pub const INVALID_MESSAGES: &str = "duplex_rpc_invalid_messages_total";
/// Applied task status transitions.
pub const TASK_TRANSITIONS: &str = "duplex_rpc_task_transitions_total";
/// Task status changes rejected as illegal.
pub const TASK_TRANSITIONS_IGNORED: &str = "duplex_rpc_task_transitions_ignored_total";
/// Tasks removed after their ttl.
pub const TASKS_PURGED: &str = "duplex_rpc_tasks_purged_total";
/// Messages queued for task callers.
pub const TASK_MESSAGES_QUEUED: &str = "duplex_rpc_task_messages_queued_total";
/// Events appended to the event log.
pub const EVENTS_STORED: &str = "duplex_rpc_events_stored_total";
/// Events resent during replay.
pub const EVENTS_REPLAYED: &str = "duplex_rpc_events_replayed_total";

/// Register all metric descriptions.
pub fn describe_metrics() {
    // Session
    describe_counter!(REQUESTS_SENT, "Total number of outbound requests written");
    describe_counter!(REQUESTS_RECEIVED, "Total number of inbound requests dispatched");
    describe_counter!(REQUEST_TIMEOUTS, "Total number of outbound requests that timed out");
    describe_counter!(
        REQUEST_CANCELLATIONS,
        "Total number of cancelled requests, labelled by direction"
    );
    describe_counter!(LATE_RESPONSES, "Total number of responses without a pending request");
    describe_histogram!(REQUEST_DURATION, "Round trip time of outbound requests");
    describe_gauge!(PENDING_REQUESTS, "Outbound requests awaiting a response");
    describe_gauge!(INBOUND_CALLS, "Inbound requests being handled");
    describe_counter!(HANDLER_PANICS, "Total number of request handlers that panicked");
    describe_counter!(INVALID_MESSAGES, "Total number of inbound messages rejected as invalid");

    // Tasks
    describe_counter!(TASK_TRANSITIONS, "Total number of applied task status transitions");
    describe_counter!(
        TASK_TRANSITIONS_IGNORED,
        "Total number of illegal task status changes that were ignored"
    );
    describe_counter!(TASKS_PURGED, "Total number of expired tasks removed");
    describe_counter!(TASK_MESSAGES_QUEUED, "Total number of messages queued for task callers");

    // Event log
    describe_counter!(EVENTS_STORED, "Total number of events appended to the event log");
    describe_counter!(EVENTS_REPLAYED, "Total number of events resent during replay");

    tracing::debug!("Registered metric descriptions");
}
