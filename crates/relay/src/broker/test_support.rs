use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fanout_common::protocol::ws::WireMessage;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::connection::{Connection, TransportError};

type CloseHook = Box<dyn FnOnce() + Send>;

/// In-memory connection driven by a [`TestPeer`].
pub(crate) struct TestConnection {
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    closed: CancellationToken,
    read_failure: CancellationToken,
    close_calls: AtomicUsize,
    fail_writes: AtomicBool,
    stall_writes: AtomicBool,
    on_close: parking_lot::Mutex<Option<CloseHook>>,
}

/// The remote end of a [`TestConnection`].
pub(crate) struct TestPeer {
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    outbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl TestConnection {
    pub(crate) fn pair() -> (Arc<Self>, TestPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            inbound: Mutex::new(inbound_rx),
            outbound: outbound_tx,
            closed: CancellationToken::new(),
            read_failure: CancellationToken::new(),
            close_calls: AtomicUsize::new(0),
            fail_writes: AtomicBool::new(false),
            stall_writes: AtomicBool::new(false),
            on_close: parking_lot::Mutex::new(None),
        });
        (connection, TestPeer { inbound: Some(inbound_tx), outbound: outbound_rx })
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Writes hang until the connection is closed.
    pub(crate) fn stall_writes(&self) {
        self.stall_writes.store(true, Ordering::SeqCst);
    }

    /// The pending and every later read fails with a socket error.
    pub(crate) fn fail_reads(&self) {
        self.read_failure.cancel();
    }

    /// Runs `hook` on the first call to `close`.
    pub(crate) fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_close.lock() = Some(Box::new(hook));
    }
}

fn broken_pipe() -> TransportError {
    TransportError::Socket(axum::Error::new(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "broken pipe",
    )))
}

#[async_trait]
impl Connection for TestConnection {
    async fn read_payload(&self) -> Result<Bytes, TransportError> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            _ = self.read_failure.cancelled() => Err(broken_pipe()),
            next = inbound.recv() => next.ok_or(TransportError::Closed),
        }
    }

    async fn write_payload(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(broken_pipe());
        }
        if self.stall_writes.load(Ordering::SeqCst) {
            self.closed.cancelled().await;
            return Err(TransportError::Closed);
        }
        self.outbound.send(payload.to_vec()).map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.cancel();
        let hook = self.on_close.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl TestPeer {
    pub(crate) fn send_json(&self, value: serde_json::Value) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Bytes::from(value.to_string()));
        }
    }

    pub(crate) fn send_raw(&self, raw: &'static [u8]) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Bytes::from_static(raw));
        }
    }

    /// Simulates the remote side going away.
    pub(crate) fn hang_up(&mut self) {
        self.inbound = None;
    }

    pub(crate) async fn recv(&mut self) -> WireMessage {
        let raw = tokio::time::timeout(Duration::from_secs(2), self.outbound.recv())
            .await
            .expect("delivery should arrive in time")
            .expect("connection should still be writable");
        serde_json::from_slice(&raw).expect("delivered frame should be an envelope")
    }

    pub(crate) fn try_recv(&mut self) -> Option<WireMessage> {
        self.outbound
            .try_recv()
            .ok()
            .map(|raw| serde_json::from_slice(&raw).expect("delivered frame should be an envelope"))
    }
}
