//! Routing of inbound envelopes.

use super::context::{NotificationContext, RequestContext};
use super::inbound::InboundCall;
use super::pending::Progress;
use super::registry::{HandlerRegistry, MethodHandler, RequestHandlerFn, StateMap};
use super::Session;
use crate::metrics::{
    HANDLER_PANICS, INVALID_MESSAGES, LATE_RESPONSES, REQUEST_CANCELLATIONS, REQUESTS_RECEIVED,
};
use duplex_rpc_core::envelope::{
    Envelope, ErrorResponse, Notification, Request, RequestId, ResultResponse,
};
use duplex_rpc_core::error::{ErrorObject, RpcError};
use duplex_rpc_core::methods::{self, CancelledParams, ProgressParams};
use duplex_rpc_core::transport::TransportError;
use futures::FutureExt;
use metrics::counter;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub(super) struct Dispatcher {
    session: Session,
    registry: Arc<HandlerRegistry>,
    state: Arc<StateMap>,
}

impl Dispatcher {
    pub(super) fn new(session: Session, registry: Arc<HandlerRegistry>) -> Self {
        let state = Arc::new(registry.state().clone());
        Self {
            session,
            registry,
            state,
        }
    }

    pub(super) async fn dispatch(&self, envelope: Envelope) {
        match envelope {
            Envelope::Request(request) => self.on_request(request).await,
            Envelope::Notification(notification) => self.on_notification(notification).await,
            Envelope::Result(ResultResponse { id, result }) => self.on_response(&id, Ok(result)),
            Envelope::Error(ErrorResponse { id, error }) => {
                self.on_response(&id, Err(RpcError::Remote(error)));
            }
        }
    }

    /// Answer a per-message transport error and keep going.
    pub(super) async fn reject(&self, error: TransportError) {
        counter!(INVALID_MESSAGES).increment(1);
        match &error {
            TransportError::InvalidMessage(decode) => {
                if let Some(id) = decode.response_id() {
                    // Responses are never answered; fail our own request instead.
                    tracing::debug!(
                        request_id = %id,
                        %error,
                        "Failing request on malformed response"
                    );
                    self.on_response(id, Err(RpcError::InvalidResult(decode.to_string())));
                } else if let Some(id) = decode.salvaged_id() {
                    tracing::debug!(request_id = %id, %error, "Rejecting invalid message");
                    self.write(Envelope::error(id.clone(), decode.error_object()))
                        .await;
                } else {
                    tracing::warn!(%error, "Dropping invalid message without a usable id");
                }
            }
            _ => tracing::warn!(%error, "Dropping unreadable message"),
        }
    }

    async fn on_request(&self, request: Request) {
        let Request { id, method, params } = request;
        counter!(REQUESTS_RECEIVED).increment(1);

        let handler = match self.registry.get(&method) {
            Some(MethodHandler::Request(handler)) => Arc::clone(handler),
            _ => {
                tracing::debug!(request_id = %id, %method, "No handler for request");
                self.write(Envelope::error(id, ErrorObject::method_not_found(&method)))
                    .await;
                return;
            }
        };

        let Some(call) = self.session.inner.calls.open(id.clone()) else {
            tracing::warn!(
                request_id = %id,
                %method,
                "Duplicate request id while the first is open"
            );
            self.write(Envelope::error(
                id,
                ErrorObject::invalid_request("Request id is already in use"),
            ))
            .await;
            return;
        };

        let cx = RequestContext {
            session: self.session.clone(),
            request_id: id.clone(),
            method,
            params,
            cancel: call.cancel_token(),
            state: Arc::clone(&self.state),
        };
        let task = tokio::spawn(run_handler(
            self.session.clone(),
            id,
            Arc::clone(&call),
            handler,
            cx,
        ));
        call.set_abort_handle(task.abort_handle());
    }

    async fn on_notification(&self, notification: Notification) {
        let Notification { method, params } = notification;
        match method.as_str() {
            methods::CANCELLED => self.on_cancelled(params),
            methods::PROGRESS => self.on_progress(params),
            _ => {
                let handler = match self.registry.get(&method) {
                    Some(MethodHandler::Notification(handler)) => Some(handler),
                    Some(MethodHandler::Request(_)) | None => self.registry.fallback_notification(),
                };
                let Some(handler) = handler else {
                    tracing::debug!(%method, "Dropping unhandled notification");
                    return;
                };
                let cx = NotificationContext {
                    session: self.session.clone(),
                    method,
                    params,
                    state: Arc::clone(&self.state),
                };
                let outcome = AssertUnwindSafe(async { handler(cx).await })
                    .catch_unwind()
                    .await;
                if outcome.is_err() {
                    counter!(HANDLER_PANICS).increment(1);
                    tracing::error!("Notification handler panicked");
                }
            }
        }
    }

    fn on_cancelled(&self, params: Option<Value>) {
        let params: CancelledParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) | Err(_) => {
                tracing::debug!("Ignoring malformed cancellation");
                return;
            }
        };
        if self.session.inner.calls.cancel(&params.request_id) {
            counter!(REQUEST_CANCELLATIONS, "direction" => "inbound").increment(1);
            tracing::debug!(
                request_id = %params.request_id,
                reason = params.reason.as_deref().unwrap_or(""),
                "Peer cancelled request"
            );
        } else {
            tracing::debug!(
                request_id = %params.request_id,
                "Cancellation for a request that is not open"
            );
        }
    }

    fn on_progress(&self, params: Option<Value>) {
        let params: ProgressParams = match params.map(serde_json::from_value).transpose() {
            Ok(Some(params)) => params,
            Ok(None) | Err(_) => {
                tracing::debug!("Ignoring malformed progress notification");
                return;
            }
        };
        match self
            .session
            .inner
            .pending
            .progress_callback(&params.progress_token)
        {
            Some(callback) => callback(Progress {
                progress: params.progress,
                total: params.total,
                message: params.message,
            }),
            None => {
                tracing::debug!(token = %params.progress_token, "Progress for an unknown request");
            }
        }
    }

    fn on_response(&self, id: &RequestId, outcome: Result<Value, RpcError>) {
        if !self.session.inner.pending.resolve(id, outcome) {
            counter!(LATE_RESPONSES).increment(1);
            tracing::debug!(request_id = %id, "Dropping response with no pending request");
        }
    }

    async fn write(&self, envelope: Envelope) {
        if let Err(error) = self.session.inner.write(envelope).await {
            tracing::debug!(%error, "Could not write response");
        }
    }
}

async fn run_handler(
    session: Session,
    id: RequestId,
    call: Arc<InboundCall>,
    handler: RequestHandlerFn,
    cx: RequestContext,
) {
    let outcome = AssertUnwindSafe(async move { handler(cx).await })
        .catch_unwind()
        .await;

    let envelope = match outcome {
        Ok(Ok(result)) => Envelope::result(id.clone(), result),
        Ok(Err(error)) => {
            tracing::debug!(request_id = %id, %error, "Handler failed");
            Envelope::error(id.clone(), error.into_error_object())
        }
        Err(_) => {
            counter!(HANDLER_PANICS).increment(1);
            tracing::error!(request_id = %id, "Request handler panicked");
            Envelope::error(id.clone(), ErrorObject::internal_error("Handler panicked"))
        }
    };

    if call.try_respond() {
        if let Err(error) = session.inner.write(envelope).await {
            tracing::debug!(request_id = %id, %error, "Could not write response");
        }
    } else {
        tracing::debug!(request_id = %id, "Dropping response for a cancelled request");
    }
    session.inner.calls.finish(&id, &call);
}
