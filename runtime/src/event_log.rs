//! In-memory resumable event log.
//!
//! [`InMemoryEventLog`] implements [`EventLog`] with one ordered vector per
//! stream. [`StreamRecorder`] is what a streaming transport holds per
//! logical stream: it records each outbound message and hands back the
//! event id to put on the wire.

use crate::metrics::{EVENTS_REPLAYED, EVENTS_STORED};
use chrono::{DateTime, Utc};
use duplex_rpc_core::environment::{Clock, SystemClock};
use duplex_rpc_core::envelope::Envelope;
use duplex_rpc_core::event_log::{
    EventLog, EventLogError, EventLogFuture, ReplaySender, ReplayedEvent, StreamEvent,
};
use duplex_rpc_core::stream::{EventId, StreamId};
use metrics::counter;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct StoredEvent {
    event: StreamEvent,
    /// Insertion sequence; breaks timestamp ties.
    seq: u64,
}

impl StoredEvent {
    const fn position(&self) -> (DateTime<Utc>, u64) {
        (self.event.timestamp, self.seq)
    }
}

#[derive(Debug, Default)]
struct LogState {
    /// Events per stream, sorted by (timestamp, seq).
    streams: HashMap<StreamId, Vec<StoredEvent>>,
    index: HashMap<EventId, StreamId>,
    next_seq: u64,
}

/// Event log kept in process memory.
///
/// Event ids are UUID v4 strings. Within a stream, events replay in
/// timestamp order with ties broken by insertion order, so a clock that
/// stands still or steps backwards still replays correctly.
///
/// # Retention
///
/// Unbounded by default. With
/// [`with_max_events_per_stream`](Self::with_max_events_per_stream) the
/// oldest events of a stream are dropped past the bound; a peer resuming
/// from a dropped id gets no replay.
///
/// # Example
///
/// ```
/// use duplex_rpc_core::envelope::Envelope;
/// use duplex_rpc_core::event_log::EventLog;
/// use duplex_rpc_core::stream::StreamId;
/// use duplex_rpc_runtime::event_log::InMemoryEventLog;
/// use tokio::sync::mpsc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let log = InMemoryEventLog::new();
/// let stream = StreamId::new("s-1");
/// let first = log.store_event(stream.clone(), Envelope::notification("a", None)).await?;
/// log.store_event(stream.clone(), Envelope::notification("b", None)).await?;
///
/// let (tx, mut rx) = mpsc::channel(8);
/// assert_eq!(log.replay_events_after(first, tx).await?, Some(stream));
/// assert_eq!(rx.recv().await.map(|e| e.message), Some(Envelope::notification("b", None)));
/// # Ok(())
/// # }
/// ```
pub struct InMemoryEventLog {
    state: Mutex<LogState>,
    clock: Arc<dyn Clock>,
    max_events_per_stream: Option<usize>,
}

impl InMemoryEventLog {
    /// Empty log on the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty log timestamping events with `clock`.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(LogState::default()),
            clock,
            max_events_per_stream: None,
        }
    }

    /// Keep at most `max` events per stream (at least one).
    #[must_use]
    pub fn with_max_events_per_stream(mut self, max: usize) -> Self {
        self.max_events_per_stream = Some(max.max(1));
        self
    }

    /// Number of events stored on `stream_id`.
    #[must_use]
    pub fn stream_len(&self, stream_id: &StreamId) -> usize {
        self.lock().streams.get(stream_id).map_or(0, Vec::len)
    }

    /// Every event stored on `stream_id`, in replay order.
    #[must_use]
    pub fn events(&self, stream_id: &StreamId) -> Vec<StreamEvent> {
        self.lock()
            .streams
            .get(stream_id)
            .map(|events| events.iter().map(|stored| stored.event.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, stream_id: StreamId, message: Envelope) -> EventId {
        let event_id = EventId::new(uuid::Uuid::new_v4().to_string());
        let timestamp = self.clock.now();

        let mut state = self.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.index.insert(event_id.clone(), stream_id.clone());

        let stored = StoredEvent {
            event: StreamEvent {
                event_id: event_id.clone(),
                stream_id: stream_id.clone(),
                message,
                timestamp,
            },
            seq,
        };
        let events = state.streams.entry(stream_id).or_default();
        let at = events.partition_point(|existing| existing.position() <= stored.position());
        events.insert(at, stored);

        let overflow = self
            .max_events_per_stream
            .map_or(0, |max| events.len().saturating_sub(max));
        let dropped: Vec<EventId> = events
            .drain(..overflow)
            .map(|stored| stored.event.event_id)
            .collect();
        for id in &dropped {
            state.index.remove(id);
        }
        event_id
    }

    /// Events after `last_event_id` on its stream, or `None` if unknown.
    fn events_after(&self, last_event_id: &EventId) -> Option<(StreamId, Vec<ReplayedEvent>)> {
        let state = self.lock();
        let stream_id = state.index.get(last_event_id)?.clone();
        let events = state.streams.get(&stream_id)?;
        let start = events
            .iter()
            .position(|stored| &stored.event.event_id == last_event_id)?
            + 1;
        let replay = events[start..]
            .iter()
            .map(|stored| ReplayedEvent {
                event_id: stored.event.event_id.clone(),
                message: stored.event.message.clone(),
            })
            .collect();
        Some((stream_id, replay))
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryEventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("InMemoryEventLog")
            .field("streams", &state.streams.len())
            .field("events", &state.index.len())
            .field("max_events_per_stream", &self.max_events_per_stream)
            .finish_non_exhaustive()
    }
}

impl EventLog for InMemoryEventLog {
    fn store_event(&self, stream_id: StreamId, message: Envelope) -> EventLogFuture<'_, EventId> {
        Box::pin(async move {
            let event_id = self.append(stream_id, message);
            counter!(EVENTS_STORED).increment(1);
            Ok(event_id)
        })
    }

    fn replay_events_after(
        &self,
        last_event_id: EventId,
        sender: ReplaySender,
    ) -> EventLogFuture<'_, Option<StreamId>> {
        Box::pin(async move {
            let Some((stream_id, events)) = self.events_after(&last_event_id) else {
                tracing::debug!(event_id = %last_event_id, "Replay requested for an unknown event");
                return Ok(None);
            };

            let total = events.len();
            for event in events {
                if sender.send(event).await.is_err() {
                    tracing::debug!(%stream_id, "Replay receiver closed");
                    return Err(EventLogError::ReplayAborted(stream_id));
                }
                counter!(EVENTS_REPLAYED).increment(1);
            }
            tracing::debug!(
                %stream_id,
                after = %last_event_id,
                replayed = total,
                "Replayed stream"
            );
            Ok(Some(stream_id))
        })
    }
}

/// Records the outbound messages of one logical stream.
#[derive(Clone)]
pub struct StreamRecorder {
    log: Arc<dyn EventLog>,
    stream_id: StreamId,
}

impl StreamRecorder {
    /// Recorder appending to `stream_id` in `log`.
    #[must_use]
    pub fn new(log: Arc<dyn EventLog>, stream_id: StreamId) -> Self {
        Self { log, stream_id }
    }

    /// Stream this recorder appends to.
    #[must_use]
    pub const fn stream_id(&self) -> &StreamId {
        &self.stream_id
    }

    /// Store `message` and return the event id to send along with it.
    ///
    /// # Errors
    ///
    /// Propagates the log's storage error.
    pub async fn record(&self, message: Envelope) -> Result<EventId, EventLogError> {
        self.log.store_event(self.stream_id.clone(), message).await
    }

    /// Replay everything after `last_event_id` for a reconnecting peer.
    ///
    /// Returns `Ok(None)` when the id is unknown or belongs to another
    /// stream; nothing is sent then.
    ///
    /// # Errors
    ///
    /// Propagates the log's replay error.
    pub async fn resume(
        &self,
        last_event_id: EventId,
        sender: ReplaySender,
    ) -> Result<Option<StreamId>, EventLogError> {
        let (tx, mut rx) = tokio::sync::mpsc::channel(sender.max_capacity());
        let replay = self.log.replay_events_after(last_event_id, tx);
        let stream_id = &self.stream_id;
        let forward = async {
            let mut forwarded = Vec::new();
            while let Some(event) = rx.recv().await {
                forwarded.push(event);
            }
            forwarded
        };
        let (replayed, events) = futures::join!(replay, forward);
        let Some(replayed) = replayed? else {
            return Ok(None);
        };
        if &replayed != stream_id {
            tracing::debug!(
                %stream_id,
                other = %replayed,
                "Resume token belongs to another stream"
            );
            return Ok(None);
        }
        for event in events {
            if sender.send(event).await.is_err() {
                return Err(EventLogError::ReplayAborted(replayed));
            }
        }
        Ok(Some(replayed))
    }
}

impl fmt::Debug for StreamRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamRecorder")
            .field("stream_id", &self.stream_id)
            .finish_non_exhaustive()
    }
}
