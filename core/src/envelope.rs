//! JSON-RPC 2.0 message envelopes.
//!
//! Every message on the wire is one of four shapes, told apart by which keys
//! are present rather than by a type tag:
//!
//! | keys                   | envelope                     |
//! |------------------------|------------------------------|
//! | `id` + `method`        | [`Envelope::Request`]        |
//! | `method`, no `id`      | [`Envelope::Notification`]   |
//! | `id` + `error`         | [`Envelope::Error`]          |
//! | `id` + `result`        | [`Envelope::Result`]         |
//!
//! An explicit `"id": null` is always rejected with [`EnvelopeError::NullId`].
//! It is never read as a notification.
//!
//! # Example
//!
//! ```
//! use duplex_rpc_core::envelope::{Envelope, RequestId};
//! use serde_json::json;
//!
//! let envelope = Envelope::from_value(json!({
//!     "jsonrpc": "2.0",
//!     "id": 7,
//!     "method": "tasks/get",
//!     "params": {"taskId": "abc"}
//! }))
//! .unwrap();
//!
//! assert_eq!(envelope.id(), Some(&RequestId::Number(7)));
//! assert_eq!(envelope.method(), Some("tasks/get"));
//! ```

use crate::error::ErrorObject;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Protocol version string every envelope carries.
pub const JSONRPC_VERSION: &str = "2.0";

/// Identifier correlating a request with its response.
///
/// Integer or string, never null.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id. Outbound ids allocated by a session are always integers.
    Number(i64),
    /// String id chosen by the peer.
    String(String),
}

impl RequestId {
    /// Interpret a raw `id` value.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::NullId`] for `null` and
    /// [`EnvelopeError::InvalidId`] for anything that is neither an integer
    /// nor a string.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        match value {
            Value::Null => Err(EnvelopeError::NullId),
            Value::String(id) => Ok(Self::String(id)),
            Value::Number(number) => number
                .as_i64()
                .map(Self::Number)
                .ok_or_else(|| EnvelopeError::InvalidId(number.to_string())),
            other => Err(EnvelopeError::InvalidId(other.to_string())),
        }
    }

    /// Id as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Number(id)
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        Self::String(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::String(id.to_string())
    }
}

/// Why a JSON value is not a valid envelope.
///
/// All variants map onto the `-32600` InvalidRequest wire code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The message is not a JSON object.
    #[error("Message is not a JSON object")]
    NotAnObject,

    /// `jsonrpc` is missing or not `"2.0"`.
    #[error("Unsupported jsonrpc version: {0}")]
    UnsupportedVersion(String),

    /// `"id": null` was sent.
    #[error("Request id must not be null")]
    NullId,

    /// `id` is neither an integer nor a string.
    #[error("Invalid request id: {0}")]
    InvalidId(String),

    /// `method` is present but not a string.
    #[error("Method must be a string")]
    InvalidMethod,

    /// `params` is present but neither an object nor an array.
    #[error("Params must be an object or an array")]
    InvalidParams,

    /// A response without an `id`.
    #[error("Response is missing its id")]
    MissingId,

    /// `error` does not have the `{code, message, data?}` shape.
    #[error("Malformed error object: {0}")]
    InvalidErrorObject(String),

    /// None of `method`, `result` or `error` is present.
    #[error("Message is neither a request, a notification nor a response")]
    UnknownShape,
}

/// A call that expects a response.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// Correlation id.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Optional structured params.
    pub params: Option<Value>,
}

/// A one-way message. Never carries an id.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Optional structured params.
    pub params: Option<Value>,
}

/// Successful answer to a [`Request`].
#[derive(Clone, Debug, PartialEq)]
pub struct ResultResponse {
    /// Id of the request being answered.
    pub id: RequestId,
    /// Result payload.
    pub result: Value,
}

/// Failed answer to a [`Request`].
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    /// Id of the request being answered.
    pub id: RequestId,
    /// Error payload.
    pub error: ErrorObject,
}

/// One message on the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// A call expecting a response.
    Request(Request),
    /// A one-way message.
    Notification(Notification),
    /// A successful response.
    Result(ResultResponse),
    /// An error response.
    Error(ErrorResponse),
}

impl Envelope {
    /// Build a request envelope.
    #[must_use]
    pub fn request(
        id: impl Into<RequestId>,
        method: impl Into<String>,
        params: Option<Value>,
    ) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Build a notification envelope.
    #[must_use]
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// Build a result response.
    #[must_use]
    pub fn result(id: impl Into<RequestId>, result: Value) -> Self {
        Self::Result(ResultResponse {
            id: id.into(),
            result,
        })
    }

    /// Build an error response.
    #[must_use]
    pub fn error(id: impl Into<RequestId>, error: ErrorObject) -> Self {
        Self::Error(ErrorResponse {
            id: id.into(),
            error,
        })
    }

    /// Classify a JSON value by field presence.
    ///
    /// # Errors
    ///
    /// Returns an [`EnvelopeError`] describing the first violation found.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        let Value::Object(mut object) = value else {
            return Err(EnvelopeError::NotAnObject);
        };

        match object.get("jsonrpc") {
            Some(Value::String(version)) if version == JSONRPC_VERSION => {}
            Some(other) => return Err(EnvelopeError::UnsupportedVersion(other.to_string())),
            None => return Err(EnvelopeError::UnsupportedVersion("missing".to_string())),
        }

        let id = object.remove("id").map(RequestId::from_value).transpose()?;

        if let Some(method) = object.remove("method") {
            let Value::String(method) = method else {
                return Err(EnvelopeError::InvalidMethod);
            };
            let params = take_params(&mut object)?;
            return Ok(match id {
                Some(id) => Self::Request(Request { id, method, params }),
                None => Self::Notification(Notification { method, params }),
            });
        }

        if let Some(error) = object.remove("error") {
            let id = id.ok_or(EnvelopeError::MissingId)?;
            let error = serde_json::from_value(error)
                .map_err(|e| EnvelopeError::InvalidErrorObject(e.to_string()))?;
            return Ok(Self::Error(ErrorResponse { id, error }));
        }

        if let Some(result) = object.remove("result") {
            let id = id.ok_or(EnvelopeError::MissingId)?;
            return Ok(Self::Result(ResultResponse { id, result }));
        }

        Err(EnvelopeError::UnknownShape)
    }

    /// Serialize into a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Request(request) => {
                object.insert("id".into(), request.id.to_value());
                object.insert("method".into(), Value::from(request.method.as_str()));
                if let Some(params) = &request.params {
                    object.insert("params".into(), params.clone());
                }
            }
            Self::Notification(notification) => {
                object.insert("method".into(), Value::from(notification.method.as_str()));
                if let Some(params) = &notification.params {
                    object.insert("params".into(), params.clone());
                }
            }
            Self::Result(response) => {
                object.insert("id".into(), response.id.to_value());
                object.insert("result".into(), response.result.clone());
            }
            Self::Error(response) => {
                object.insert("id".into(), response.id.to_value());
                object.insert(
                    "error".into(),
                    serde_json::to_value(&response.error).unwrap_or(Value::Null),
                );
            }
        }
        Value::Object(object)
    }

    /// Correlation id, absent only for notifications.
    #[must_use]
    pub const fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Request(Request { id, .. })
            | Self::Result(ResultResponse { id, .. })
            | Self::Error(ErrorResponse { id, .. }) => Some(id),
            Self::Notification(_) => None,
        }
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(Request { method, .. })
            | Self::Notification(Notification { method, .. }) => Some(method),
            Self::Result(_) | Self::Error(_) => None,
        }
    }

    /// Short name of the variant, for logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Notification(_) => "notification",
            Self::Result(_) => "result",
            Self::Error(_) => "error",
        }
    }

    /// Whether this envelope answers a request.
    #[must_use]
    pub const fn is_response(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Error(_))
    }
}

fn take_params(object: &mut Map<String, Value>) -> Result<Option<Value>, EnvelopeError> {
    match object.remove("params") {
        None | Some(Value::Null) => Ok(None),
        Some(params @ (Value::Object(_) | Value::Array(_))) => Ok(Some(params)),
        Some(_) => Err(EnvelopeError::InvalidParams),
    }
}

impl From<Request> for Envelope {
    fn from(request: Request) -> Self {
        Self::Request(request)
    }
}

impl From<Notification> for Envelope {
    fn from(notification: Notification) -> Self {
        Self::Notification(notification)
    }
}

impl From<ResultResponse> for Envelope {
    fn from(response: ResultResponse) -> Self {
        Self::Result(response)
    }
}

impl From<ErrorResponse> for Envelope {
    fn from(response: ErrorResponse) -> Self {
        Self::Error(response)
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        match self {
            Self::Request(request) => {
                map.serialize_entry("id", &request.id)?;
                map.serialize_entry("method", &request.method)?;
                if let Some(params) = &request.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Self::Notification(notification) => {
                map.serialize_entry("method", &notification.method)?;
                if let Some(params) = &notification.params {
                    map.serialize_entry("params", params)?;
                }
            }
            Self::Result(response) => {
                map.serialize_entry("id", &response.id)?;
                map.serialize_entry("result", &response.result)?;
            }
            Self::Error(response) => {
                map.serialize_entry("id", &response.id)?;
                map.serialize_entry("error", &response.error)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}
