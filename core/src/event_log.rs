//! Resumable event log contract.
//!
//! Streaming transports record every outbound message in an [`EventLog`]
//! before sending it. When a peer reconnects with the id of the last event it
//! received, [`EventLog::replay_events_after`] pushes the rest of that event's
//! stream to the new connection.
//!
//! # Ordering
//!
//! Replay order within a stream is ascending timestamp, ties broken by
//! insertion order. It never depends on how event ids compare.
//!
//! # Example
//!
//! ```no_run
//! use duplex_rpc_core::event_log::{EventLog, EventLogError, ReplayedEvent};
//! use duplex_rpc_core::stream::EventId;
//! use tokio::sync::mpsc;
//!
//! async fn resume<L: EventLog>(log: &L, last_seen: EventId) -> Result<(), EventLogError> {
//!     let (tx, mut rx) = mpsc::channel::<ReplayedEvent>(64);
//!     let replay = log.replay_events_after(last_seen, tx);
//!     // Drain while replaying so a bounded channel never stalls.
//!     let (stream, ()) = futures::join!(replay, async {
//!         while let Some(event) = rx.recv().await {
//!             let _ = event;
//!         }
//!     });
//!     let _stream = stream?;
//!     Ok(())
//! }
//! ```

use crate::envelope::Envelope;
use crate::stream::{EventId, StreamId};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur during event log operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventLogError {
    /// The replay receiver went away before every event was sent.
    #[error("Replay of stream {0} aborted: receiver closed")]
    ReplayAborted(StreamId),

    /// The backing storage failed.
    #[error("Event log storage error: {0}")]
    Storage(String),
}

/// One stored message.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    /// Resume token handed to the peer.
    pub event_id: EventId,
    /// Stream the event belongs to.
    pub stream_id: StreamId,
    /// The recorded message.
    pub message: Envelope,
    /// When it was stored.
    pub timestamp: DateTime<Utc>,
}

/// An event delivered during replay.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplayedEvent {
    /// Id the peer should remember as its new resume point.
    pub event_id: EventId,
    /// The message to resend.
    pub message: Envelope,
}

/// Sending half used to push replayed events to a reconnecting peer.
pub type ReplaySender = mpsc::Sender<ReplayedEvent>;

/// Boxed future returned by event log operations.
pub type EventLogFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, EventLogError>> + Send + 'a>>;

/// Append-only store of outbound messages, grouped by stream.
///
/// # Dyn Compatibility
///
/// Methods return boxed futures so a transport can hold `Arc<dyn EventLog>`.
pub trait EventLog: Send + Sync {
    /// Store a message on `stream_id` and return its fresh event id.
    ///
    /// # Errors
    ///
    /// [`EventLogError::Storage`] if the event cannot be persisted.
    fn store_event(&self, stream_id: StreamId, message: Envelope) -> EventLogFuture<'_, EventId>;

    /// Replay every event stored after `last_event_id` on the same stream.
    ///
    /// Returns `Ok(None)` without sending anything when the id is unknown,
    /// otherwise the stream id once every later event has been sent.
    ///
    /// # Errors
    ///
    /// [`EventLogError::ReplayAborted`] if the receiver closes mid-replay,
    /// [`EventLogError::Storage`] on backend failure.
    fn replay_events_after(
        &self,
        last_event_id: EventId,
        sender: ReplaySender,
    ) -> EventLogFuture<'_, Option<StreamId>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = EventLogError::ReplayAborted(StreamId::new("s-1"));
        assert_eq!(err.to_string(), "Replay of stream s-1 aborted: receiver closed");
        let err = EventLogError::Storage("disk full".into());
        assert_eq!(err.to_string(), "Event log storage error: disk full");
    }

    #[allow(dead_code)]
    fn assert_dyn_compatible(_: &dyn EventLog) {}
}
