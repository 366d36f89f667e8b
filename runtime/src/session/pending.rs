//! Outbound requests awaiting a response.

use crate::metrics::PENDING_REQUESTS;
use duplex_rpc_core::envelope::RequestId;
use duplex_rpc_core::error::RpcError;
use metrics::gauge;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;

/// A progress update for a pending request.
#[derive(Clone, Debug, PartialEq)]
pub struct Progress {
    /// Progress so far.
    pub progress: f64,
    /// Total, when known.
    pub total: Option<f64>,
    /// Optional human-readable detail.
    pub message: Option<String>,
}

/// Callback receiving [`Progress`] for one request.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

pub(crate) type Outcome = Result<Value, RpcError>;

struct PendingEntry {
    waiter: oneshot::Sender<Outcome>,
    progress: Option<ProgressCallback>,
}

#[derive(Default)]
struct PendingState {
    entries: HashMap<RequestId, PendingEntry>,
    closed: bool,
}

/// Table of outbound requests keyed by id.
///
/// Removing an entry is the only way to reach its waiter, so every request
/// resolves at most once no matter how responses, timeouts and cancellation
/// race.
pub(crate) struct PendingRequests {
    state: Mutex<PendingState>,
    limit: usize,
}

impl PendingRequests {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            state: Mutex::new(PendingState::default()),
            limit,
        }
    }

    /// Register a waiter for `id`.
    pub(crate) fn register(
        &self,
        id: RequestId,
        progress: Option<ProgressCallback>,
    ) -> Result<oneshot::Receiver<Outcome>, RpcError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.closed {
            return Err(RpcError::ConnectionClosed);
        }
        if state.entries.len() >= self.limit {
            return Err(RpcError::TooManyPending(self.limit));
        }
        let (waiter, rx) = oneshot::channel();
        state.entries.insert(id, PendingEntry { waiter, progress });
        gauge!(PENDING_REQUESTS).increment(1.0);
        Ok(rx)
    }

    /// Hand `outcome` to the waiter for `id`. Returns `false` when nothing
    /// was waiting (late or unknown response).
    pub(crate) fn resolve(&self, id: &RequestId, outcome: Outcome) -> bool {
        let entry = self.take(id);
        entry.is_some_and(|entry| {
            // The caller may have stopped listening; the slot is gone either way.
            let _ = entry.waiter.send(outcome);
            true
        })
    }

    /// Drop the waiter for `id` without resolving it. Returns whether an
    /// entry was removed.
    pub(crate) fn remove(&self, id: &RequestId) -> bool {
        self.take(id).is_some()
    }

    /// Progress callback of a pending request.
    pub(crate) fn progress_callback(&self, id: &RequestId) -> Option<ProgressCallback> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.entries.get(id).and_then(|entry| entry.progress.clone())
    }

    /// Fail every waiter with `ConnectionClosed` and refuse new ones.
    pub(crate) fn fail_all(&self) -> usize {
        let entries: Vec<PendingEntry> = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.closed = true;
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        let count = entries.len();
        for entry in entries {
            let _ = entry.waiter.send(Err(RpcError::ConnectionClosed));
            gauge!(PENDING_REQUESTS).decrement(1.0);
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .len()
    }

    fn take(&self, id: &RequestId) -> Option<PendingEntry> {
        let entry = self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entries
            .remove(id);
        if entry.is_some() {
            gauge!(PENDING_REQUESTS).decrement(1.0);
        }
        entry
    }
}

impl fmt::Debug for PendingRequests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequests")
            .field("len", &self.len())
            .field("limit", &self.limit)
            .finish()
    }
}
