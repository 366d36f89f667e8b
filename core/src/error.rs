//! Error taxonomy shared by both peers.
//!
//! Three kinds of failure travel through the engine:
//!
//! - [`ErrorObject`]: the wire-level error carried by an error response.
//! - [`HandlerError`]: what a request handler returns when it cannot produce
//!   a result. The session turns it into an [`ErrorObject`].
//! - [`RpcError`]: the local outcome of an outbound request that did not
//!   produce a result (remote error, timeout, cancellation, lost connection).

use crate::envelope::RequestId;
use crate::task::TaskError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Numeric error codes used on the wire.
///
/// The first five are the standard JSON-RPC 2.0 codes, the rest are
/// application codes reserved by this protocol.
pub mod codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal error while handling the request.
    pub const INTERNAL_ERROR: i64 = -32603;
    /// The connection closed before a response arrived.
    pub const CONNECTION_CLOSED: i64 = -32000;
    /// The request did not complete within its deadline.
    pub const REQUEST_TIMEOUT: i64 = -32001;
    /// A referenced resource does not exist.
    pub const RESOURCE_NOT_FOUND: i64 = -32002;
    /// The request was cancelled by the caller.
    pub const REQUEST_CANCELLED: i64 = -32800;
}

/// Wire-level error carried by an error response.
#[derive(Error, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct ErrorObject {
    /// Numeric error code, see [`codes`].
    pub code: i64,
    /// Short human-readable description.
    pub message: String,
    /// Optional structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Create an error object with an arbitrary code.
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// `-32700`: the peer sent bytes that are not JSON.
    #[must_use]
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(codes::PARSE_ERROR, message)
    }

    /// `-32600`: the message is JSON but not a valid envelope.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_REQUEST, message)
    }

    /// `-32601`: no handler is registered for `method`.
    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    /// `-32602`: the params did not match what the handler expects.
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    /// `-32603`: the handler failed.
    #[must_use]
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL_ERROR, message)
    }

    /// `-32000`: the connection went away.
    #[must_use]
    pub fn connection_closed() -> Self {
        Self::new(codes::CONNECTION_CLOSED, "Connection closed")
    }

    /// `-32001`: the request ran past its deadline.
    #[must_use]
    pub fn request_timeout(message: impl Into<String>) -> Self {
        Self::new(codes::REQUEST_TIMEOUT, message)
    }

    /// `-32800`: the caller cancelled the request.
    #[must_use]
    pub fn request_cancelled(message: impl Into<String>) -> Self {
        Self::new(codes::REQUEST_CANCELLED, message)
    }
}

/// Failure returned by a request handler.
///
/// The session maps each variant onto an error response:
/// [`HandlerError::InvalidParams`] becomes `-32602`, [`HandlerError::Rpc`] is
/// sent verbatim, everything else becomes `-32603`.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// The params could not be interpreted.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// A fully formed error object to send back to the caller.
    #[error(transparent)]
    Rpc(ErrorObject),

    /// Any other failure inside the handler.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandlerError {
    /// Shorthand for [`HandlerError::Internal`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Convert into the error object written on the wire.
    #[must_use]
    pub fn into_error_object(self) -> ErrorObject {
        match self {
            Self::InvalidParams(message) => ErrorObject::invalid_params(message),
            Self::Rpc(error) => error,
            Self::Internal(message) => ErrorObject::internal_error(message),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::InvalidParams(error.to_string())
    }
}

impl From<ErrorObject> for HandlerError {
    fn from(error: ErrorObject) -> Self {
        Self::Rpc(error)
    }
}

impl From<RpcError> for HandlerError {
    fn from(error: RpcError) -> Self {
        match error {
            RpcError::Remote(error) => Self::Rpc(error),
            other => Self::Rpc(other.to_error_object()),
        }
    }
}

impl From<TaskError> for HandlerError {
    fn from(error: TaskError) -> Self {
        match error {
            TaskError::Storage(message) => Self::Internal(message),
            other => Self::InvalidParams(other.to_string()),
        }
    }
}

/// Local outcome of an outbound request that did not yield a result.
#[derive(Error, Debug)]
pub enum RpcError {
    /// The peer answered with an error response.
    #[error("Remote error: {0}")]
    Remote(ErrorObject),

    /// No response arrived before the deadline.
    #[error("Request {id} timed out after {timeout:?}")]
    Timeout {
        /// Id of the abandoned request.
        id: RequestId,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The caller cancelled the request.
    #[error("Request {0} was cancelled")]
    Cancelled(RequestId),

    /// The session ended before a response arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The pending-request table is full.
    #[error("Too many pending requests (limit {0})")]
    TooManyPending(usize),

    /// Params could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The result did not have the expected shape.
    #[error("Invalid result: {0}")]
    InvalidResult(String),
}

impl RpcError {
    /// Wire code that best describes this failure.
    #[must_use]
    pub const fn code(&self) -> i64 {
        match self {
            Self::Remote(error) => error.code,
            Self::Timeout { .. } => codes::REQUEST_TIMEOUT,
            Self::Cancelled(_) => codes::REQUEST_CANCELLED,
            Self::ConnectionClosed => codes::CONNECTION_CLOSED,
            Self::TooManyPending(_) | Self::Serialization(_) | Self::InvalidResult(_) => {
                codes::INTERNAL_ERROR
            }
        }
    }

    /// Error object to relay when a handler passes this failure on.
    #[must_use]
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            Self::Remote(error) => error.clone(),
            Self::Timeout { .. } => ErrorObject::request_timeout(self.to_string()),
            Self::Cancelled(_) => ErrorObject::request_cancelled(self.to_string()),
            Self::ConnectionClosed => ErrorObject::connection_closed(),
            Self::TooManyPending(_) | Self::Serialization(_) | Self::InvalidResult(_) => {
                ErrorObject::internal_error(self.to_string())
            }
        }
    }

    /// The remote error object, if the peer answered with one.
    #[must_use]
    pub const fn as_remote(&self) -> Option<&ErrorObject> {
        match self {
            Self::Remote(error) => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn error_object_omits_absent_data() {
        let value = serde_json::to_value(ErrorObject::method_not_found("tools/call")).unwrap();
        assert_eq!(
            value,
            json!({"code": -32601, "message": "Method not found: tools/call"})
        );
    }

    #[test]
    fn error_object_keeps_data() {
        let error = ErrorObject::internal_error("boom").with_data(json!({"trace": "x"}));
        let back: ErrorObject =
            serde_json::from_value(serde_json::to_value(&error).unwrap()).unwrap();
        assert_eq!(back, error);
    }

    #[test]
    fn handler_error_mapping() {
        assert_eq!(
            HandlerError::InvalidParams("missing name".into())
                .into_error_object()
                .code,
            codes::INVALID_PARAMS
        );
        assert_eq!(
            HandlerError::internal("db down").into_error_object().code,
            codes::INTERNAL_ERROR
        );
        let custom = ErrorObject::new(42, "custom");
        assert_eq!(HandlerError::Rpc(custom.clone()).into_error_object(), custom);
    }

    #[test]
    fn serde_failures_are_invalid_params() {
        let err = serde_json::from_value::<u32>(json!("nope")).unwrap_err();
        assert!(matches!(HandlerError::from(err), HandlerError::InvalidParams(_)));
    }

    #[test]
    fn rpc_error_codes() {
        assert_eq!(RpcError::ConnectionClosed.code(), codes::CONNECTION_CLOSED);
        assert_eq!(
            RpcError::Cancelled(RequestId::Number(1)).code(),
            codes::REQUEST_CANCELLED
        );
        assert_eq!(
            RpcError::Timeout {
                id: RequestId::Number(1),
                timeout: Duration::from_millis(5),
            }
            .code(),
            codes::REQUEST_TIMEOUT
        );
        assert_eq!(RpcError::Remote(ErrorObject::new(7, "x")).code(), 7);
    }

    #[test]
    fn remote_errors_pass_through_handlers() {
        let remote = ErrorObject::invalid_params("bad");
        match HandlerError::from(RpcError::Remote(remote.clone())) {
            HandlerError::Rpc(error) => assert_eq!(error, remote),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn local_failures_relay_with_their_own_codes() {
        let relayed = |error: RpcError| HandlerError::from(error).into_error_object();

        assert_eq!(relayed(RpcError::ConnectionClosed), ErrorObject::connection_closed());
        let cancelled = relayed(RpcError::Cancelled(RequestId::Number(3)));
        assert_eq!(cancelled.code, codes::REQUEST_CANCELLED);
        assert_eq!(cancelled.message, "Request 3 was cancelled");
        let timeout = relayed(RpcError::Timeout {
            id: RequestId::Number(4),
            timeout: Duration::from_secs(1),
        });
        assert_eq!(timeout.code, codes::REQUEST_TIMEOUT);
        assert_eq!(
            relayed(RpcError::InvalidResult("not a number".into())).code,
            codes::INTERNAL_ERROR
        );
    }
}
