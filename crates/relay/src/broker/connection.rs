use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The peer closed the socket, or the connection was closed locally.
    #[error("connection closed")]
    Closed,
    #[error("socket error: {0}")]
    Socket(#[from] axum::Error),
    #[error("outbound payload is not valid UTF-8")]
    NonUtf8Payload,
}

impl TransportError {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// One device's duplex channel, as consumed by the broker.
///
/// Reads happen only on the connection's handler task and writes only on the
/// dispatcher task of the shard that owns it, so implementations may keep
/// the two halves behind independent locks.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Waits for the next inbound payload. Returns [`TransportError::Closed`]
    /// on a clean close or once [`Connection::close`] has been called.
    async fn read_payload(&self) -> Result<Bytes, TransportError>;

    async fn write_payload(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Marks the connection closed and wakes a pending read. Idempotent.
    fn close(&self);
}

pub type ConnectionHandle = Arc<dyn Connection>;
