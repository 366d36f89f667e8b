//! Transport contract consumed by a session.
//!
//! A transport turns some byte channel (stdio, an HTTP exchange, a socket,
//! an in-memory pipe) into an ordered [`Connection`]: a stream of inbound
//! envelopes and a sink for outbound ones. Framing and byte limits are the
//! transport's business; the session only sees envelopes.

use crate::codec::DecodeError;
use crate::envelope::Envelope;
use futures::{Sink, Stream};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors surfaced by a transport.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The channel is closed.
    #[error("Transport closed")]
    Closed,

    /// The underlying channel failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// The byte stream could not be split into messages.
    #[error("Framing error: {0}")]
    Framing(String),

    /// One message could not be decoded.
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] DecodeError),

    /// One message body exceeded the byte limit.
    #[error("Body too large: limit is {limit} bytes")]
    BodyTooLarge {
        /// The configured limit.
        limit: usize,
    },
}

impl TransportError {
    /// Whether the connection is still usable after this error.
    ///
    /// Per-message failures are recoverable; closure, I/O and framing
    /// failures end the session.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidMessage(_) | Self::BodyTooLarge { .. })
    }
}

/// Inbound half of a connection.
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<Envelope, TransportError>> + Send>>;

/// Outbound half of a connection.
pub type OutboundSink = Pin<Box<dyn Sink<Envelope, Error = TransportError> + Send>>;

/// One established, ordered, bidirectional message channel.
pub struct Connection {
    /// Envelopes from the peer, in arrival order. Ends when the peer is gone.
    pub inbound: InboundStream,
    /// Envelopes to the peer.
    pub outbound: OutboundSink,
}

impl Connection {
    /// Box a stream and a sink into a connection.
    pub fn new<I, O>(inbound: I, outbound: O) -> Self
    where
        I: Stream<Item = Result<Envelope, TransportError>> + Send + 'static,
        O: Sink<Envelope, Error = TransportError> + Send + 'static,
    {
        Self {
            inbound: Box::pin(inbound),
            outbound: Box::pin(outbound),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Something that can establish connections, once or repeatedly.
///
/// A reconnecting client calls [`Transport::connect`] again after a
/// connection ends and starts a new session on the result.
pub trait Transport: Send {
    /// Establish a connection.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] when no connection can be made.
    fn connect(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Connection, TransportError>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeError;
    use futures::SinkExt as _;

    #[test]
    fn recoverable_split() {
        assert!(!TransportError::Closed.is_recoverable());
        assert!(!TransportError::Io("reset".into()).is_recoverable());
        assert!(!TransportError::Framing("bad header".into()).is_recoverable());
        assert!(TransportError::BodyTooLarge { limit: 10 }.is_recoverable());
        assert!(TransportError::InvalidMessage(DecodeError::Invalid {
            id: None,
            source: EnvelopeError::NullId,
        })
        .is_recoverable());
    }

    #[test]
    fn connection_accepts_plain_streams() {
        let inbound = futures::stream::empty::<Result<Envelope, TransportError>>();
        let outbound = futures::sink::drain::<Envelope>().sink_map_err(|_| TransportError::Closed);
        let connection = Connection::new(inbound, outbound);
        assert_eq!(format!("{connection:?}"), "Connection { .. }");
    }
}
