//! Identifiers for resumable event streams.
//!
//! A streaming transport tags each outbound message with an [`EventId`] and
//! groups related messages into a stream identified by a [`StreamId`] (for
//! example one stream per in-flight request, or one standalone stream per
//! session). After a reconnect the peer presents the last [`EventId`] it saw
//! and the log replays the rest of that stream.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error type for `StreamId` parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid stream ID: {0}")]
pub struct ParseStreamIdError(String);

/// Identifier of one logical message stream.
///
/// # Validation
///
/// - `FromStr::from_str()` rejects empty strings; use it for ids supplied by
///   a peer.
/// - `From::from()` and `new()` do not validate.
///
/// # Examples
///
/// ```
/// use duplex_rpc_core::stream::StreamId;
///
/// let stream_id = StreamId::new("request-7");
/// assert_eq!(stream_id.as_str(), "request-7");
///
/// let parsed: StreamId = "standalone".parse().unwrap();
/// assert_eq!(parsed, StreamId::new("standalone"));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    /// Create a `StreamId` from a string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the stream ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert into the inner `String`.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseStreamIdError("Stream ID cannot be empty".to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl From<String> for StreamId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of one stored event, handed to the peer as its resume token.
///
/// Ids are opaque: replay order never depends on how they compare.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Wrap an existing token.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EventId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    mod stream_id {
        use super::*;

        #[test]
        fn display_matches_inner() {
            let id = StreamId::new("request-1");
            assert_eq!(format!("{id}"), "request-1");
            assert_eq!(id.clone().into_inner(), "request-1");
        }

        #[test]
        fn from_str_rejects_empty() {
            let err = "".parse::<StreamId>().unwrap_err();
            assert!(err.to_string().contains("cannot be empty"));
        }

        #[test]
        fn serializes_transparently() {
            let json = serde_json::to_string(&StreamId::new("s")).unwrap();
            assert_eq!(json, "\"s\"");
        }
    }

    mod event_id {
        use super::*;

        #[test]
        fn round_trips_through_json() {
            let id = EventId::new("0b7e");
            let back: EventId = serde_json::from_str(&serde_json::to_string(&id).unwrap()).unwrap();
            assert_eq!(back, id);
            assert_eq!(back.as_str(), "0b7e");
        }
    }
}
