//! Inbound requests currently being handled.

use crate::metrics::INBOUND_CALLS;
use duplex_rpc_core::envelope::RequestId;
use metrics::gauge;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

const OPEN: u8 = 0;
const RESPONDED: u8 = 1;
const CANCELLED: u8 = 2;

/// One handler invocation.
///
/// The state moves `open → responded` or `open → cancelled` by
/// compare-and-swap only, so a response and a cancellation racing for the
/// same call cannot both win.
#[derive(Debug)]
pub(crate) struct InboundCall {
    state: AtomicU8,
    cancel: CancellationToken,
    abort: Mutex<Option<AbortHandle>>,
}

impl InboundCall {
    /// A call whose token is also cancelled when `parent` is.
    fn new(parent: &CancellationToken) -> Self {
        Self {
            state: AtomicU8::new(OPEN),
            cancel: parent.child_token(),
            abort: Mutex::new(None),
        }
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Claim the right to write the response.
    pub(crate) fn try_respond(&self) -> bool {
        self.state
            .compare_exchange(OPEN, RESPONDED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Cancel the call unless it already responded.
    pub(crate) fn try_cancel(&self) -> bool {
        if self
            .state
            .compare_exchange(OPEN, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.cancel.cancel();
        if let Some(handle) = self
            .abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        true
    }

    /// Attach the handler task. Aborts it straight away if the call was
    /// cancelled before the task existed.
    pub(crate) fn set_abort_handle(&self, handle: AbortHandle) {
        let mut slot = self.abort.lock().unwrap_or_else(PoisonError::into_inner);
        if self.state.load(Ordering::Acquire) == CANCELLED {
            handle.abort();
        } else {
            *slot = Some(handle);
        }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == OPEN
    }
}

/// Table of open inbound calls keyed by request id.
#[derive(Debug, Default)]
pub(crate) struct InboundCalls {
    calls: Mutex<HashMap<RequestId, Arc<InboundCall>>>,
    shutdown: CancellationToken,
}

impl InboundCalls {
    /// Calls opened here observe `shutdown` through their own tokens.
    pub(crate) fn new(shutdown: CancellationToken) -> Self {
        Self {
            calls: Mutex::default(),
            shutdown,
        }
    }

    /// Open a call for `id`. Returns `None` if a call with that id is
    /// already open.
    pub(crate) fn open(&self, id: RequestId) -> Option<Arc<InboundCall>> {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        if calls.contains_key(&id) {
            return None;
        }
        let call = Arc::new(InboundCall::new(&self.shutdown));
        calls.insert(id, Arc::clone(&call));
        gauge!(INBOUND_CALLS).increment(1.0);
        Some(call)
    }

    /// Forget a finished call. Only removes the entry if it is still `call`.
    pub(crate) fn finish(&self, id: &RequestId, call: &Arc<InboundCall>) {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        if calls.get(id).is_some_and(|current| Arc::ptr_eq(current, call)) {
            calls.remove(id);
            gauge!(INBOUND_CALLS).decrement(1.0);
        }
    }

    /// Cancel the call for `id`. Returns `false` if it is unknown or has
    /// already responded.
    pub(crate) fn cancel(&self, id: &RequestId) -> bool {
        let call = self
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned();
        let Some(call) = call else {
            return false;
        };
        let cancelled = call.try_cancel();
        if cancelled {
            self.finish(id, &call);
        }
        cancelled
    }

    /// Cancel every open call.
    pub(crate) fn cancel_all(&self) -> usize {
        let calls: Vec<Arc<InboundCall>> = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.drain().map(|(_, call)| call).collect()
        };
        for _ in &calls {
            gauge!(INBOUND_CALLS).decrement(1.0);
        }
        calls.iter().filter(|call| call.try_cancel()).count()
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn respond_and_cancel_are_exclusive() {
        let root = CancellationToken::new();
        let call = InboundCall::new(&root);
        assert!(call.try_respond());
        assert!(!call.try_cancel());
        assert!(!call.try_respond());
        assert!(!call.cancel_token().is_cancelled());

        let call = InboundCall::new(&root);
        assert!(call.try_cancel());
        assert!(!call.try_respond());
        assert!(call.cancel_token().is_cancelled());
        assert!(!root.is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_reaches_every_handler_token() {
        let shutdown = CancellationToken::new();
        let calls = InboundCalls::new(shutdown.clone());
        let first = calls.open(RequestId::Number(1)).unwrap().cancel_token();
        let second = calls.open(RequestId::Number(2)).unwrap().cancel_token();
        assert!(!first.is_cancelled());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), second.cancelled())
            .await
            .unwrap();
        assert!(first.is_cancelled());
    }

    #[test]
    fn concurrent_race_has_one_winner() {
        for _ in 0..200 {
            let call = Arc::new(InboundCall::new(&CancellationToken::new()));
            let responder = {
                let call = Arc::clone(&call);
                std::thread::spawn(move || call.try_respond())
            };
            let canceller = {
                let call = Arc::clone(&call);
                std::thread::spawn(move || call.try_cancel())
            };
            let responded = responder.join().unwrap();
            let cancelled = canceller.join().unwrap();
            assert!(responded ^ cancelled);
            assert!(!call.is_open());
        }
    }

    #[test]
    fn duplicate_open_ids_are_refused() {
        let calls = InboundCalls::default();
        let first = calls.open(RequestId::Number(1)).unwrap();
        assert!(calls.open(RequestId::Number(1)).is_none());

        calls.finish(&RequestId::Number(1), &first);
        assert_eq!(calls.len(), 0);
        assert!(calls.open(RequestId::Number(1)).is_some());
    }

    #[tokio::test]
    async fn cancel_aborts_the_handler_task() {
        let calls = InboundCalls::default();
        let call = calls.open(RequestId::Number(9)).unwrap();
        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        call.set_abort_handle(task.abort_handle());

        assert!(calls.cancel(&RequestId::Number(9)));
        assert!(task.await.unwrap_err().is_cancelled());
        assert!(!calls.cancel(&RequestId::Number(9)));
    }

    #[tokio::test]
    async fn late_abort_handle_is_aborted_immediately() {
        let calls = InboundCalls::default();
        let call = calls.open(RequestId::Number(2)).unwrap();
        assert!(calls.cancel(&RequestId::Number(2)));

        let task = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(30)).await;
        });
        call.set_abort_handle(task.abort_handle());
        assert!(task.await.unwrap_err().is_cancelled());
    }
}
