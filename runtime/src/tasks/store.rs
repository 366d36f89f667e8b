//! In-memory task persistence.
//!
//! [`InMemoryTaskStore`] and [`InMemoryMessageQueue`] keep everything in
//! process memory behind a mutex. They are the default backends of
//! [`TaskEngine::in_memory`](super::TaskEngine::in_memory) and what the test
//! suites run against.

use chrono::{DateTime, TimeDelta, Utc};
use duplex_rpc_core::task::{QueuedMessage, TaskError, TaskId, TransitionOutcome};
use duplex_rpc_core::task_store::{
    StatusChange, TaskFuture, TaskMessageQueue, TaskPage, TaskRecord, TaskStore,
};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::ops::Bound;
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
struct Stored {
    /// Creation sequence number.
    seq: u64,
    record: TaskRecord,
}

#[derive(Debug, Default)]
struct StoreState {
    records: HashMap<TaskId, Stored>,
    /// Creation order, for pagination.
    order: BTreeMap<u64, TaskId>,
    next_seq: u64,
}

impl StoreState {
    fn remove(&mut self, task_id: &TaskId) -> bool {
        match self.records.remove(task_id) {
            Some(stored) => {
                self.order.remove(&stored.seq);
                true
            }
            None => false,
        }
    }

    /// Sequence number behind a cursor this store handed out.
    fn cursor_seq(&self, cursor: &str) -> Option<u64> {
        if cursor.len() != 16 || !cursor.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u64::from_str_radix(cursor, 16)
            .ok()
            .filter(|seq| *seq < self.next_seq)
    }
}

fn cursor_for(seq: u64) -> String {
    format!("{seq:016x}")
}

/// Task records in a `HashMap`, paginated in creation order.
///
/// Cursors encode a creation sequence number rather than a task id, so a
/// cursor stays valid after the task it was taken from expires and is
/// removed. A page stays stable while later tasks are created.
///
/// # Example
///
/// ```
/// use duplex_rpc_core::task_store::TaskStore;
/// use duplex_rpc_runtime::tasks::InMemoryTaskStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = InMemoryTaskStore::new();
/// let page = store.list(None, 10).await?;
/// assert!(page.records.is_empty());
/// assert_eq!(page.next_cursor, None);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    state: Mutex<StoreState>,
}

impl InMemoryTaskStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// `at + ttl`, or `None` when the sum does not fit.
fn expiry(at: DateTime<Utc>, ttl_ms: u64) -> Option<DateTime<Utc>> {
    let ttl_ms = i64::try_from(ttl_ms).ok()?;
    at.checked_add_signed(TimeDelta::try_milliseconds(ttl_ms)?)
}

impl TaskStore for InMemoryTaskStore {
    fn insert(&self, record: TaskRecord) -> TaskFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            let task_id = record.task.task_id.clone();
            if let Some(stored) = state.records.get_mut(&task_id) {
                stored.record = record;
                return Ok(());
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.order.insert(seq, task_id.clone());
            state.records.insert(task_id, Stored { seq, record });
            Ok(())
        })
    }

    fn get(&self, task_id: TaskId) -> TaskFuture<'_, Option<TaskRecord>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .records
                .get(&task_id)
                .map(|stored| stored.record.clone()))
        })
    }

    fn transition(
        &self,
        task_id: TaskId,
        change: StatusChange,
    ) -> TaskFuture<'_, TransitionOutcome> {
        Box::pin(async move {
            let mut state = self.lock();
            let record = &mut state
                .records
                .get_mut(&task_id)
                .ok_or_else(|| TaskError::NotFound(task_id.clone()))?
                .record;

            let current = record.task.status;
            if !current.can_transition_to(change.status) {
                return Ok(TransitionOutcome::Ignored { current });
            }

            record.task.status = change.status;
            record.task.status_message = change.message;
            record.task.last_updated_at = change.at;
            if change.status.is_terminal() {
                record.outcome = change.outcome;
                record.expires_at = record.task.ttl.and_then(|ttl| expiry(change.at, ttl));
            }
            Ok(TransitionOutcome::Applied(record.task.clone()))
        })
    }

    fn list(&self, cursor: Option<String>, limit: usize) -> TaskFuture<'_, TaskPage> {
        Box::pin(async move {
            let state = self.lock();
            let start = match cursor {
                None => Bound::Unbounded,
                Some(cursor) => Bound::Excluded(
                    state
                        .cursor_seq(&cursor)
                        .ok_or(TaskError::InvalidCursor(cursor))?,
                ),
            };

            let mut remaining = state.order.range((start, Bound::Unbounded));
            let page: Vec<(&u64, &TaskId)> = remaining.by_ref().take(limit).collect();
            let next_cursor = match (page.last(), remaining.next()) {
                (Some((seq, _)), Some(_)) => Some(cursor_for(**seq)),
                _ => None,
            };
            let records = page
                .into_iter()
                .filter_map(|(_, id)| state.records.get(id).map(|stored| stored.record.clone()))
                .collect();
            Ok(TaskPage {
                records,
                next_cursor,
            })
        })
    }

    fn remove(&self, task_id: TaskId) -> TaskFuture<'_, bool> {
        Box::pin(async move { Ok(self.lock().remove(&task_id)) })
    }

    fn remove_expired(&self, now: DateTime<Utc>) -> TaskFuture<'_, Vec<TaskId>> {
        Box::pin(async move {
            let mut state = self.lock();
            let mut expired: Vec<(u64, TaskId)> = state
                .records
                .values()
                .filter(|stored| stored.record.is_expired(now))
                .map(|stored| (stored.seq, stored.record.task.task_id.clone()))
                .collect();
            expired.sort_unstable_by_key(|(seq, _)| *seq);
            for (_, task_id) in &expired {
                state.remove(task_id);
            }
            Ok(expired.into_iter().map(|(_, task_id)| task_id).collect())
        })
    }
}

/// Per-task FIFO queues in a `HashMap`.
#[derive(Debug, Default)]
pub struct InMemoryMessageQueue {
    queues: Mutex<HashMap<TaskId, VecDeque<QueuedMessage>>>,
}

impl InMemoryMessageQueue {
    /// Empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, VecDeque<QueuedMessage>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl TaskMessageQueue for InMemoryMessageQueue {
    fn enqueue(&self, task_id: TaskId, message: QueuedMessage) -> TaskFuture<'_, ()> {
        Box::pin(async move {
            self.lock().entry(task_id).or_default().push_back(message);
            Ok(())
        })
    }

    fn drain(&self, task_id: TaskId) -> TaskFuture<'_, Vec<QueuedMessage>> {
        Box::pin(async move {
            Ok(self
                .lock()
                .remove(&task_id)
                .map(Vec::from)
                .unwrap_or_default())
        })
    }

    fn pending_count(&self, task_id: TaskId) -> TaskFuture<'_, usize> {
        Box::pin(async move { Ok(self.lock().get(&task_id).map_or(0, VecDeque::len)) })
    }

    fn clear(&self, task_id: TaskId) -> TaskFuture<'_, ()> {
        Box::pin(async move {
            self.lock().remove(&task_id);
            Ok(())
        })
    }
}
