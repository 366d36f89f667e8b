//! Per-call context handed to handlers.

use super::registry::StateMap;
use super::{CancellationToken, Session};
use duplex_rpc_core::envelope::RequestId;
use duplex_rpc_core::error::HandlerError;
use duplex_rpc_core::methods::{self, ProgressParams};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::sync::Arc;

fn parse_params<T: DeserializeOwned>(params: Option<&Value>) -> Result<T, HandlerError> {
    let value = params
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));
    Ok(serde_json::from_value(value)?)
}

/// Progress token a request carries in `params._meta.progressToken`.
pub(crate) fn progress_token(params: Option<&Value>) -> Option<RequestId> {
    let raw = params?.get("_meta")?.get("progressToken")?.clone();
    RequestId::from_value(raw).ok()
}

/// Everything a request handler knows about its call.
#[derive(Clone)]
pub struct RequestContext {
    pub(crate) session: Session,
    pub(crate) request_id: RequestId,
    pub(crate) method: String,
    pub(crate) params: Option<Value>,
    pub(crate) cancel: CancellationToken,
    pub(crate) state: Arc<StateMap>,
}

impl RequestContext {
    /// Session the request arrived on. Use it to call back into the peer.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Id of the request being handled.
    #[must_use]
    pub const fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Method being handled.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Params as received.
    #[must_use]
    pub const fn raw_params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    /// Params deserialized into `T`. Absent params read as `{}`.
    ///
    /// # Errors
    ///
    /// [`HandlerError::InvalidParams`] if the params do not fit `T`.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        parse_params(self.params.as_ref())
    }

    /// Token cancelled when the peer sends `notifications/cancelled` for this
    /// request or the session ends.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Whether the call has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Shared state registered with
    /// [`HandlerRegistry::with_state`](super::HandlerRegistry::with_state).
    #[must_use]
    pub fn state<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.state.get::<T>()
    }

    /// Send `notifications/progress` for this request if the caller asked
    /// for progress. Does nothing otherwise.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<String>,
    ) {
        let Some(progress_token) = progress_token(self.params.as_ref()) else {
            return;
        };
        let params = ProgressParams {
            progress_token,
            progress,
            total,
            message,
        };
        match serde_json::to_value(params) {
            Ok(params) => {
                self.session
                    .send_notification(methods::PROGRESS, Some(params))
                    .await;
            }
            Err(error) => tracing::warn!(%error, "Failed to encode progress"),
        }
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

/// Everything a notification handler knows about its message.
#[derive(Clone)]
pub struct NotificationContext {
    pub(crate) session: Session,
    pub(crate) method: String,
    pub(crate) params: Option<Value>,
    pub(crate) state: Arc<StateMap>,
}

impl NotificationContext {
    /// Session the notification arrived on.
    #[must_use]
    pub const fn session(&self) -> &Session {
        &self.session
    }

    /// Notification method.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Params as received.
    #[must_use]
    pub const fn raw_params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    /// Params deserialized into `T`. Absent params read as `{}`.
    ///
    /// # Errors
    ///
    /// [`HandlerError::InvalidParams`] if the params do not fit `T`.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        parse_params(self.params.as_ref())
    }

    /// Shared state registered with the registry.
    #[must_use]
    pub fn state<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.state.get::<T>()
    }
}

impl std::fmt::Debug for NotificationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationContext")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}
