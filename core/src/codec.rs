//! Byte-level encoding of envelopes.
//!
//! Transports that frame raw bytes (newline-delimited stdio, HTTP bodies)
//! use [`encode`] and [`decode`]. A [`DecodeError`] knows which wire error to
//! answer with and, where the input still carried a usable id, which request
//! the answer belongs to. Malformed responses are never answered; their id
//! only tells the receiver which of its own requests to fail.

use crate::envelope::{Envelope, EnvelopeError, RequestId};
use crate::error::ErrorObject;
use serde_json::Value;
use thiserror::Error;

/// Failure to turn bytes into an [`Envelope`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The bytes are not JSON. Answered with `-32700`.
    #[error("Parse error: {0}")]
    Parse(String),

    /// The JSON is not a valid envelope. Answered with `-32600`.
    #[error("Invalid request: {source}")]
    Invalid {
        /// Id recovered from the input, when it had a non-null one.
        id: Option<RequestId>,
        /// What was wrong with the envelope.
        source: EnvelopeError,
    },

    /// The JSON looks like a response (`result` or `error`, no `method`)
    /// but is not a valid one.
    #[error("Invalid response {id}: {source}")]
    InvalidResponse {
        /// Id of the local request the response claims to answer.
        id: RequestId,
        /// What was wrong with the envelope.
        source: EnvelopeError,
    },
}

impl DecodeError {
    /// Id to address the error response to, if one could be recovered.
    #[must_use]
    pub const fn salvaged_id(&self) -> Option<&RequestId> {
        match self {
            Self::Parse(_) | Self::InvalidResponse { .. } => None,
            Self::Invalid { id, .. } => id.as_ref(),
        }
    }

    /// Id of the local request a malformed response was addressed to.
    #[must_use]
    pub const fn response_id(&self) -> Option<&RequestId> {
        match self {
            Self::InvalidResponse { id, .. } => Some(id),
            Self::Parse(_) | Self::Invalid { .. } => None,
        }
    }

    /// Wire error describing this failure.
    #[must_use]
    pub fn error_object(&self) -> ErrorObject {
        match self {
            Self::Parse(message) => ErrorObject::parse_error(message.clone()),
            Self::Invalid { source, .. } | Self::InvalidResponse { source, .. } => {
                ErrorObject::invalid_request(source.to_string())
            }
        }
    }
}

/// Encode an envelope as compact JSON.
///
/// # Errors
///
/// Returns the serializer error if a payload cannot be represented as JSON.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(envelope)
}

/// Decode one envelope from JSON bytes.
///
/// # Errors
///
/// [`DecodeError::Parse`] for malformed JSON, [`DecodeError::Invalid`] for
/// JSON that is not an envelope.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Parse(e.to_string()))?;
    decode_value(value)
}

/// Classify an already-parsed JSON value.
///
/// # Errors
///
/// [`DecodeError::InvalidResponse`] when a response-shaped value is not a
/// valid response, [`DecodeError::Invalid`] for anything else that is not an
/// envelope.
pub fn decode_value(value: Value) -> Result<Envelope, DecodeError> {
    let id = value
        .get("id")
        .cloned()
        .and_then(|raw| RequestId::from_value(raw).ok());
    let has_method = value.get("method").is_some();
    let response_shaped =
        !has_method && (value.get("result").is_some() || value.get("error").is_some());

    Envelope::from_value(value).map_err(|source| match id {
        Some(id) if response_shaped => DecodeError::InvalidResponse { id, source },
        // Only requests are answered, so only they keep their id.
        id => DecodeError::Invalid {
            id: id.filter(|_| has_method),
            source,
        },
    })
}
