//! Session correlation core.
//!
//! A [`Session`] owns one [`Connection`] and lets both sides act as client
//! and server at once:
//!
//! - outbound requests get a fresh integer id and a slot in the pending
//!   table; the matching response, a timeout, a cancellation or the end of
//!   the connection resolves the slot exactly once;
//! - inbound requests are dispatched to a [`HandlerRegistry`] and each runs
//!   in its own task, with at most one response written per request;
//! - `notifications/cancelled` and `notifications/progress` are handled by
//!   the session itself.
//!
//! # Tasks
//!
//! `Session::start` spawns two tokio tasks: the dispatch loop reading the
//! inbound stream and a writer draining a bounded queue into the outbound
//! sink. Both end when the connection ends or [`Session::close`] is called.
//!
//! # Example
//!
//! ```no_run
//! use duplex_rpc_core::transport::Connection;
//! use duplex_rpc_runtime::config::SessionConfig;
//! use duplex_rpc_runtime::session::{HandlerRegistry, RequestOptions, Session};
//! use serde_json::json;
//!
//! # async fn example(connection: Connection) -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = HandlerRegistry::new();
//! registry.on_request("ping", |_cx| async { Ok(json!({})) });
//!
//! let session = Session::start(connection, registry, SessionConfig::default());
//! let pong = session
//!     .send_request("ping", None, RequestOptions::default())
//!     .await?;
//! assert_eq!(pong, json!({}));
//! session.close();
//! # Ok(())
//! # }
//! ```

mod context;
mod dispatch;
mod inbound;
mod pending;
mod registry;

pub use context::{NotificationContext, RequestContext};
pub use pending::{Progress, ProgressCallback};
pub use registry::{
    BoxFuture, HandlerRegistry, MethodHandler, NotificationHandlerFn, RequestHandlerFn,
};
pub use tokio_util::sync::CancellationToken;

use crate::config::SessionConfig;
use crate::metrics::{REQUEST_CANCELLATIONS, REQUEST_DURATION, REQUEST_TIMEOUTS, REQUESTS_SENT};
use dispatch::Dispatcher;
use duplex_rpc_core::envelope::{Envelope, RequestId};
use duplex_rpc_core::error::RpcError;
use duplex_rpc_core::methods::{self, CancelledParams};
use duplex_rpc_core::transport::{Connection, InboundStream, OutboundSink};
use futures::{SinkExt, StreamExt};
use inbound::InboundCalls;
use metrics::{counter, histogram};
use pending::PendingRequests;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};

/// Why a session ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SessionExit {
    /// The peer closed the inbound stream.
    PeerClosed,
    /// [`Session::close`] was called.
    Closed,
    /// The transport failed.
    TransportFailed(String),
}

/// Per-call options for [`Session::send_request`].
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// Deadline overriding [`SessionConfig::request_timeout`].
    pub timeout: Option<Duration>,
    /// Abandon the request when this token is cancelled.
    pub cancel: Option<CancellationToken>,
    /// Receive `notifications/progress` for this request.
    pub progress: Option<ProgressCallback>,
}

impl RequestOptions {
    /// Set a per-call deadline
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Attach a progress callback
    #[must_use]
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOptions")
            .field("timeout", &self.timeout)
            .field("cancel", &self.cancel.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

pub(crate) struct SessionInner {
    id: String,
    config: SessionConfig,
    outbound: mpsc::Sender<Envelope>,
    next_id: AtomicI64,
    pending: PendingRequests,
    calls: InboundCalls,
    shutdown: CancellationToken,
    stop_reason: Mutex<Option<SessionExit>>,
    exit: watch::Sender<Option<SessionExit>>,
}

impl SessionInner {
    async fn write(&self, envelope: Envelope) -> Result<(), RpcError> {
        self.outbound
            .send(envelope)
            .await
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Queue `envelope` without waiting; usable from `Drop`.
    fn write_detached(&self, envelope: Envelope) {
        match self.outbound.try_send(envelope) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(envelope)) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let outbound = self.outbound.clone();
                    runtime.spawn(async move {
                        let _ = outbound.send(envelope).await;
                    });
                }
            }
        }
    }

    fn send_cancelled(&self, id: &RequestId, reason: &str) {
        let params = CancelledParams {
            request_id: id.clone(),
            reason: Some(reason.to_string()),
        };
        match serde_json::to_value(params) {
            Ok(params) => {
                self.write_detached(Envelope::notification(methods::CANCELLED, Some(params)));
            }
            Err(error) => tracing::warn!(%error, "Failed to encode cancellation"),
        }
    }

    fn stop(&self, reason: SessionExit) {
        self.stop_reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(reason);
        self.shutdown.cancel();
    }

    fn teardown(&self, exit: SessionExit) {
        self.shutdown.cancel();
        let failed = self.pending.fail_all();
        let cancelled = self.calls.cancel_all();
        tracing::info!(
            session_id = %self.id,
            ?exit,
            failed_requests = failed,
            cancelled_calls = cancelled,
            "Session ended"
        );
        self.exit.send_replace(Some(exit));
    }
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Start a session on `connection`.
    ///
    /// Must be called inside a tokio runtime: spawns the dispatch loop and
    /// the writer task.
    #[must_use]
    pub fn start(connection: Connection, registry: HandlerRegistry, config: SessionConfig) -> Self {
        let Connection { inbound, outbound } = connection;
        let (tx, rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (exit, _) = watch::channel(None);
        let shutdown = CancellationToken::new();
        let inner = Arc::new(SessionInner {
            id: uuid::Uuid::new_v4().to_string(),
            pending: PendingRequests::new(config.max_pending_requests),
            config,
            outbound: tx,
            next_id: AtomicI64::new(0),
            calls: InboundCalls::new(shutdown.clone()),
            shutdown,
            stop_reason: Mutex::new(None),
            exit,
        });
        let session = Self { inner };
        tracing::debug!(session_id = %session.inner.id, "Session started");

        tokio::spawn(write_loop(Arc::clone(&session.inner), rx, outbound));
        tokio::spawn(run(session.clone(), inbound, Arc::new(registry)));
        session
    }

    /// Identifier used in logs.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Configuration the session runs with.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    /// Send a request and wait for its outcome.
    ///
    /// Cancelling `options.cancel`, dropping the returned future and hitting
    /// the deadline all free the pending slot and send the peer a
    /// best-effort `notifications/cancelled`.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Remote`] when the peer answers with an error
    /// - [`RpcError::Timeout`] when the deadline passes
    /// - [`RpcError::Cancelled`] when the token is cancelled
    /// - [`RpcError::ConnectionClosed`] when the session ends first
    /// - [`RpcError::TooManyPending`] when the pending table is full
    /// - [`RpcError::InvalidResult`] when the peer's response is malformed
    #[tracing::instrument(
        skip(self, params, options),
        fields(session_id = %self.inner.id, request_id = tracing::field::Empty)
    )]
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, RpcError> {
        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::Span::current().record("request_id", tracing::field::display(&id));
        let timeout = options.timeout.unwrap_or(self.inner.config.request_timeout);
        let params = if options.progress.is_some() {
            with_progress_token(params, &id)
        } else {
            params
        };

        let rx = self.inner.pending.register(id.clone(), options.progress)?;
        let mut guard = PendingGuard {
            inner: &self.inner,
            id: id.clone(),
            written: false,
            reason: Some("dropped"),
        };

        self.inner
            .write(Envelope::request(id.clone(), method, params))
            .await?;
        guard.written = true;
        counter!(REQUESTS_SENT).increment(1);
        let started = Instant::now();

        let outcome = tokio::select! {
            resolved = rx => {
                guard.disarm();
                resolved.unwrap_or(Err(RpcError::ConnectionClosed))
            }
            () = tokio::time::sleep(timeout) => {
                counter!(REQUEST_TIMEOUTS).increment(1);
                tracing::debug!(?timeout, "Request timed out");
                guard.reason = Some("timeout");
                Err(RpcError::Timeout { id: id.clone(), timeout })
            }
            () = wait_cancelled(options.cancel.as_ref()) => {
                counter!(REQUEST_CANCELLATIONS, "direction" => "outbound").increment(1);
                tracing::debug!("Request cancelled by caller");
                guard.reason = Some("cancelled");
                Err(RpcError::Cancelled(id.clone()))
            }
        };
        histogram!(REQUEST_DURATION).record(started.elapsed().as_secs_f64());
        outcome
    }

    /// Typed request: serialize `params`, deserialize the result into `R`.
    ///
    /// # Errors
    ///
    /// As [`Session::send_request`], plus [`RpcError::Serialization`] for
    /// unserializable params and [`RpcError::InvalidResult`] when the result
    /// does not fit `R`.
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.request_with(method, params, RequestOptions::default())
            .await
    }

    /// Typed request with explicit options.
    ///
    /// # Errors
    ///
    /// See [`Session::request`].
    pub async fn request_with<P, R>(
        &self,
        method: &str,
        params: &P,
        options: RequestOptions,
    ) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params =
            serde_json::to_value(params).map_err(|e| RpcError::Serialization(e.to_string()))?;
        let params = (!params.is_null()).then_some(params);
        let result = self.send_request(method, params, options).await?;
        serde_json::from_value(result).map_err(|e| RpcError::InvalidResult(e.to_string()))
    }

    /// Send a notification. Failures are logged, never returned.
    pub async fn send_notification(&self, method: &str, params: Option<Value>) {
        if let Err(error) = self
            .inner
            .write(Envelope::notification(method, params))
            .await
        {
            tracing::warn!(
                session_id = %self.inner.id,
                method,
                %error,
                "Failed to send notification"
            );
        }
    }

    /// Ask the session to stop. Pending requests fail with
    /// [`RpcError::ConnectionClosed`] and running handlers are cancelled.
    pub fn close(&self) {
        self.inner.stop(SessionExit::Closed);
    }

    /// Wait for the session to end.
    pub async fn closed(&self) -> SessionExit {
        let mut rx = self.inner.exit.subscribe();
        let exit = rx
            .wait_for(Option::is_some)
            .await
            .map(|exit| exit.clone())
            .ok()
            .flatten();
        exit.unwrap_or(SessionExit::Closed)
    }

    /// Whether the session has ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.exit.borrow().is_some()
    }

    /// Number of outbound requests awaiting a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Number of inbound requests still being handled.
    #[must_use]
    pub fn inbound_calls(&self) -> usize {
        self.inner.calls.len()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("pending", &self.inner.pending)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Frees a pending slot when `send_request` stops waiting without a
/// response, and tells the peer the request was abandoned.
struct PendingGuard<'a> {
    inner: &'a SessionInner,
    id: RequestId,
    written: bool,
    /// Reason sent to the peer; `None` once a response arrived.
    reason: Option<&'static str>,
}

impl PendingGuard<'_> {
    const fn disarm(&mut self) {
        self.reason = None;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let Some(reason) = self.reason else {
            return;
        };
        if self.inner.pending.remove(&self.id) && self.written {
            if reason == "dropped" {
                counter!(REQUEST_CANCELLATIONS, "direction" => "outbound").increment(1);
            }
            self.inner.send_cancelled(&self.id, reason);
        }
    }
}

async fn wait_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn with_progress_token(params: Option<Value>, id: &RequestId) -> Option<Value> {
    let mut params = match params {
        None => Map::new(),
        Some(Value::Object(map)) => map,
        Some(other) => {
            tracing::debug!("Progress requested but params are not an object");
            return Some(other);
        }
    };
    let meta = params
        .entry("_meta")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(meta) = meta {
        meta.insert("progressToken".to_string(), id.to_value());
    }
    Some(Value::Object(params))
}

async fn write_loop(
    inner: Arc<SessionInner>,
    mut rx: mpsc::Receiver<Envelope>,
    mut sink: OutboundSink,
) {
    let shutdown = inner.shutdown.clone();
    loop {
        tokio::select! {
            biased;
            next = rx.recv() => {
                let Some(envelope) = next else { break };
                if let Err(error) = sink.send(envelope).await {
                    tracing::warn!(session_id = %inner.id, %error, "Transport write failed");
                    inner.stop(SessionExit::TransportFailed(error.to_string()));
                    return;
                }
            }
            () = shutdown.cancelled() => {
                // Flush what was queued before the stop.
                while let Ok(envelope) = rx.try_recv() {
                    if sink.send(envelope).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    if let Err(error) = sink.close().await {
        tracing::debug!(session_id = %inner.id, %error, "Closing transport failed");
    }
}

async fn run(session: Session, mut inbound: InboundStream, registry: Arc<HandlerRegistry>) {
    let inner = Arc::clone(&session.inner);
    let shutdown = inner.shutdown.clone();
    let dispatcher = Dispatcher::new(session, registry);

    let exit = loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                break inner
                    .stop_reason
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take()
                    .unwrap_or(SessionExit::Closed);
            }
            next = inbound.next() => match next {
                Some(Ok(envelope)) => dispatcher.dispatch(envelope).await,
                Some(Err(error)) if error.is_recoverable() => dispatcher.reject(error).await,
                Some(Err(error)) => {
                    tracing::warn!(session_id = %inner.id, %error, "Transport failed");
                    break SessionExit::TransportFailed(error.to_string());
                }
                None => break SessionExit::PeerClosed,
            },
        }
    };

    inner.teardown(exit);
}
