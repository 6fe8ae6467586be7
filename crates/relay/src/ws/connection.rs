use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::broker::connection::{Connection, TransportError};

/// An upgraded axum WebSocket exposed as a broker [`Connection`].
///
/// Reads come only from the connection's handler; writes come from any
/// dispatcher holding the connection, serialized by the sink lock.
pub struct WsConnection {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
    closed: CancellationToken,
}

impl WsConnection {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self { sink: Mutex::new(sink), stream: Mutex::new(stream), closed: CancellationToken::new() }
    }

    async fn send_close_frame(&self) {
        let _ = self.sink.lock().await.close().await;
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn read_payload(&self) -> Result<Bytes, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.closed.cancelled() => {
                    self.send_close_frame().await;
                    return Err(TransportError::Closed);
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(message @ (Message::Text(_) | Message::Binary(_)))) => {
                    return Ok(message.into_data());
                }
                // Pongs are answered by the protocol layer.
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Err(error)) => return Err(TransportError::Socket(error)),
            }
        }
    }

    async fn write_payload(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let text = std::str::from_utf8(payload).map_err(|_| TransportError::NonUtf8Payload)?;
        self.sink.lock().await.send(Message::Text(text.to_owned().into())).await?;
        Ok(())
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
