//! In-memory transports.
//!
//! Every channel here is bounded, so backpressure behaves as it would over a
//! real pipe.

use duplex_rpc_core::body;
use duplex_rpc_core::envelope::Envelope;
use duplex_rpc_core::transport::{Connection, Transport, TransportError};
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt, stream};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

type Frame = Result<Envelope, TransportError>;

fn half(capacity: usize) -> (mpsc::Sender<Frame>, mpsc::Receiver<Frame>) {
    mpsc::channel(capacity.max(1))
}

fn outbound(
    tx: mpsc::Sender<Frame>,
) -> impl futures::Sink<Envelope, Error = TransportError> + Send + 'static {
    tx.sink_map_err(|_| TransportError::Closed).with(|envelope: Envelope| {
        futures::future::ready(Ok::<Frame, TransportError>(Ok(envelope)))
    })
}

async fn next_envelope(rx: &mut mpsc::Receiver<Frame>) -> Option<Envelope> {
    loop {
        if let Ok(envelope) = rx.next().await? {
            return Some(envelope);
        }
    }
}

/// Two connections wired to each other.
///
/// Closing one side's outbound sink ends the other side's inbound stream.
#[must_use]
pub fn pair(capacity: usize) -> (Connection, Connection) {
    let (a_tx, a_rx) = half(capacity);
    let (b_tx, b_rx) = half(capacity);
    (
        Connection::new(b_rx, outbound(a_tx)),
        Connection::new(a_rx, outbound(b_tx)),
    )
}

/// A connection whose peer is driven by hand.
///
/// Use it to put exact envelopes (or transport errors) on the wire and to
/// assert on what the session writes.
#[must_use]
pub fn raw(capacity: usize) -> (Connection, RawPeer) {
    let (to_session, from_peer) = half(capacity);
    let (to_peer, from_session) = half(capacity);
    let peer = RawPeer {
        tx: to_session,
        rx: from_session,
    };
    (Connection::new(from_peer, outbound(to_peer)), peer)
}

/// Scripted end of a [`raw`] connection.
#[derive(Debug)]
pub struct RawPeer {
    tx: mpsc::Sender<Frame>,
    rx: mpsc::Receiver<Frame>,
}

impl RawPeer {
    /// Put an envelope on the wire.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the session stopped reading.
    pub async fn send(&mut self, envelope: Envelope) -> Result<(), TransportError> {
        self.tx
            .send(Ok(envelope))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Deliver a transport error to the session instead of an envelope.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the session stopped reading.
    pub async fn send_error(&mut self, error: TransportError) -> Result<(), TransportError> {
        self.tx
            .send(Err(error))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next envelope the session wrote, `None` once its sink is closed.
    pub async fn recv(&mut self) -> Option<Envelope> {
        next_envelope(&mut self.rx).await
    }

    /// [`RawPeer::recv`] with a deadline. `None` on timeout as well.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Next envelope that is not a notification.
    pub async fn recv_skipping_notifications(&mut self) -> Option<Envelope> {
        loop {
            let envelope = self.recv().await?;
            if !matches!(envelope, Envelope::Notification(_)) {
                return Some(envelope);
            }
        }
    }

    /// End the session's inbound stream, as a peer hanging up would.
    pub fn close(&mut self) {
        self.tx.close_channel();
    }
}

/// A connection whose inbound side receives raw message bodies, the way an
/// HTTP transport does.
///
/// Each body is collected with [`body::read_envelope`] under
/// `max_body_bytes` (usually `SessionConfig::max_body_bytes`) before the
/// session sees it.
#[must_use]
pub fn bodies(capacity: usize, max_body_bytes: usize) -> (Connection, BodyPeer) {
    let (to_session, from_peer) = mpsc::channel::<Vec<Vec<u8>>>(capacity.max(1));
    let (to_peer, from_session) = half(capacity);
    let inbound = from_peer.then(move |chunks| {
        let chunks = stream::iter(chunks.into_iter().map(Ok::<_, Infallible>));
        body::read_envelope(chunks, max_body_bytes)
    });
    let peer = BodyPeer {
        tx: to_session,
        rx: from_session,
    };
    (Connection::new(inbound, outbound(to_peer)), peer)
}

/// Posting end of a [`bodies`] connection.
#[derive(Debug)]
pub struct BodyPeer {
    tx: mpsc::Sender<Vec<Vec<u8>>>,
    rx: mpsc::Receiver<Frame>,
}

impl BodyPeer {
    /// Post `bytes` as one body split into chunks of `chunk_size`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Closed`] once the session stopped reading.
    pub async fn post(&mut self, bytes: &[u8], chunk_size: usize) -> Result<(), TransportError> {
        let chunks: Vec<Vec<u8>> = bytes.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect();
        self.tx
            .send(chunks)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next envelope the session wrote, `None` on timeout or once its sink
    /// is closed.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, next_envelope(&mut self.rx))
            .await
            .ok()
            .flatten()
    }
}

/// Reconnectable client end: each [`Transport::connect`] makes a fresh
/// [`pair`] and hands the other end to the matching [`MemoryListener`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    capacity: usize,
    accept: tokio::sync::mpsc::Sender<Connection>,
}

/// Server end of a [`connector`].
#[derive(Debug)]
pub struct MemoryListener {
    incoming: tokio::sync::mpsc::Receiver<Connection>,
}

impl MemoryListener {
    /// Next connection, `None` once every connector is dropped.
    pub async fn accept(&mut self) -> Option<Connection> {
        self.incoming.recv().await
    }
}

/// A connector/listener couple whose connections use channels of
/// `capacity`.
#[must_use]
pub fn connector(capacity: usize) -> (MemoryConnector, MemoryListener) {
    let (accept, incoming) = tokio::sync::mpsc::channel(16);
    (
        MemoryConnector { capacity, accept },
        MemoryListener { incoming },
    )
}

impl Transport for MemoryConnector {
    fn connect(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Connection, TransportError>> + Send + '_>> {
        Box::pin(async move {
            let (client, server) = pair(self.capacity);
            self.accept
                .send(server)
                .await
                .map_err(|_| TransportError::Io("listener dropped".to_string()))?;
            Ok(client)
        })
    }
}
