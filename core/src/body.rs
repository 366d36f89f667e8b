//! Size-limited body reading for byte-framed transports.
//!
//! HTTP-style transports receive a message body as a stream of chunks.
//! [`read_limited`] collects it while enforcing a byte cap and stops pulling
//! chunks as soon as the cap is exceeded, so an oversized body is rejected
//! without being buffered.

use crate::codec;
use crate::envelope::Envelope;
use crate::transport::TransportError;
use futures::{Stream, StreamExt};
use thiserror::Error;

/// Default cap on one message body: 4 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;

/// Failure while collecting a body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    /// The body exceeded `limit` bytes.
    #[error("Body too large: limit is {limit} bytes")]
    TooLarge {
        /// The configured limit.
        limit: usize,
    },

    /// The chunk stream itself failed.
    #[error("Body stream error: {0}")]
    Source(String),
}

impl From<BodyError> for TransportError {
    fn from(error: BodyError) -> Self {
        match error {
            BodyError::TooLarge { limit } => Self::BodyTooLarge { limit },
            BodyError::Source(message) => Self::Io(message),
        }
    }
}

/// Collect a chunked body of at most `limit` bytes.
///
/// # Errors
///
/// [`BodyError::TooLarge`] as soon as the running total passes `limit`,
/// [`BodyError::Source`] if a chunk fails.
pub async fn read_limited<S, B, E>(body: S, limit: usize) -> Result<Vec<u8>, BodyError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let mut body = std::pin::pin!(body);
    let mut buffer = Vec::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| BodyError::Source(e.to_string()))?;
        let chunk = chunk.as_ref();
        if buffer.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge { limit });
        }
        buffer.extend_from_slice(chunk);
    }
    Ok(buffer)
}

/// Collect a chunked body and decode it as one envelope.
///
/// # Errors
///
/// [`TransportError::BodyTooLarge`] for oversize bodies,
/// [`TransportError::InvalidMessage`] when the bytes are not an envelope.
pub async fn read_envelope<S, B, E>(body: S, limit: usize) -> Result<Envelope, TransportError>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
    E: std::fmt::Display,
{
    let bytes = read_limited(body, limit).await?;
    Ok(codec::decode(&bytes)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<&'static [u8], String>> {
        stream::iter(parts.iter().map(|p| Ok(p.as_bytes())).collect::<Vec<_>>())
    }

    #[tokio::test]
    async fn collects_within_limit() {
        let body = read_limited(chunks(&["ab", "cd"]), 4).await.unwrap();
        assert_eq!(body, b"abcd");
    }

    #[tokio::test]
    async fn stops_as_soon_as_limit_is_passed() {
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let endless = stream::repeat(vec![0_u8; 1024]).map(move |chunk| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(chunk)
        });

        let err = read_limited(endless, 4096).await.unwrap_err();
        assert_eq!(err, BodyError::TooLarge { limit: 4096 });
        assert_eq!(pulled.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn source_errors_surface() {
        let failing = stream::iter(vec![Ok(b"x".to_vec()), Err("reset by peer")]);
        let err = read_limited(failing, 10).await.unwrap_err();
        assert_eq!(err, BodyError::Source("reset by peer".into()));
    }

    #[tokio::test]
    async fn oversize_is_distinct_from_protocol_errors() {
        let err = read_envelope(chunks(&["{\"jsonrpc\":\"2.0\"}"]), 4).await.unwrap_err();
        assert!(matches!(err, TransportError::BodyTooLarge { limit: 4 }));

        let err = read_envelope(chunks(&["{oops"]), 1024).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn decodes_envelope() {
        let envelope = read_envelope(
            chunks(&["{\"jsonrpc\":\"2.0\",", "\"method\":\"ping\",\"id\":1}"]),
            DEFAULT_MAX_BODY_BYTES,
        )
        .await
        .unwrap();
        assert_eq!(envelope.method(), Some("ping"));
    }
}
