// Reusable message values for inbound decoding.
//
// A `PooledMessage` returns its `Message` to the pool when dropped. During
// fan-out the handler wraps it in an `Arc` and hands one clone to each target
// shard, so the message goes back only after the last dispatcher holding it
// has finished writing.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use fanout_common::protocol::ws::{decode_inbound, encode_outbound_into, FrameError, OutboundFrame};
use parking_lot::Mutex;
use serde_json::value::RawValue;

use crate::metrics::BrokerMetrics;

/// A message shared read-only by every dispatcher it was routed to.
pub type SharedMessage = Arc<PooledMessage>;

#[derive(Debug, Default)]
pub struct Message {
    pub timestamp: i64,
    pub sender: String,
    pub device: String,
    pub payload: Option<Box<RawValue>>,
    pub receivers: Vec<String>,
    encoded: Vec<u8>,
}

impl Message {
    /// Fills `payload` and `receivers` from an inbound frame. Identity fields
    /// are left for [`Message::stamp`].
    pub fn decode_from(&mut self, raw: &[u8]) -> Result<(), FrameError> {
        let frame = decode_inbound(raw)?;
        self.payload = frame.payload.map(ToOwned::to_owned);
        self.receivers.clear();
        self.receivers.extend(frame.receivers);
        Ok(())
    }

    pub fn stamp(&mut self, sender: &str, device: &str, timestamp: i64) {
        self.sender.clear();
        self.sender.push_str(sender);
        self.device.clear();
        self.device.push_str(device);
        self.timestamp = timestamp;
    }

    /// Serializes the envelope once; dispatchers write [`Message::encoded`].
    pub fn encode(&mut self) -> serde_json::Result<()> {
        let frame = OutboundFrame {
            timestamp: self.timestamp,
            device: &self.device,
            sender: &self.sender,
            payload: self.payload.as_deref(),
            receivers: &self.receivers,
        };
        encode_outbound_into(&frame, &mut self.encoded)
    }

    pub fn encoded(&self) -> &[u8] {
        &self.encoded
    }

    /// Clears every field while keeping allocated capacity.
    pub fn reset(&mut self) {
        self.timestamp = 0;
        self.sender.clear();
        self.device.clear();
        self.payload = None;
        self.receivers.clear();
        self.encoded.clear();
    }

    pub fn is_blank(&self) -> bool {
        self.timestamp == 0
            && self.sender.is_empty()
            && self.device.is_empty()
            && self.payload.is_none()
            && self.receivers.is_empty()
            && self.encoded.is_empty()
    }
}

#[derive(Debug)]
pub struct MessagePool {
    idle: Mutex<Vec<Message>>,
    retain: usize,
    metrics: Arc<BrokerMetrics>,
}

impl MessagePool {
    /// `retain` bounds how many idle messages are kept; extras are dropped.
    pub fn new(retain: usize, metrics: Arc<BrokerMetrics>) -> Arc<Self> {
        Arc::new(Self { idle: Mutex::new(Vec::with_capacity(retain.min(1024))), retain, metrics })
    }

    pub fn acquire(self: &Arc<Self>) -> PooledMessage {
        let reused = self.idle.lock().pop();
        self.metrics.record_pool_acquire(reused.is_some());
        PooledMessage { message: reused.unwrap_or_default(), pool: Arc::clone(self) }
    }

    pub fn release(&self, mut message: Message) {
        message.reset();
        self.metrics.record_pool_release();
        let mut idle = self.idle.lock();
        if idle.len() < self.retain {
            idle.push(message);
        }
    }

    pub fn idle_len(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A [`Message`] on loan from a [`MessagePool`].
#[derive(Debug)]
pub struct PooledMessage {
    message: Message,
    pool: Arc<MessagePool>,
}

impl PooledMessage {
    pub fn into_shared(self) -> SharedMessage {
        Arc::new(self)
    }
}

impl Deref for PooledMessage {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

impl DerefMut for PooledMessage {
    fn deref_mut(&mut self) -> &mut Message {
        &mut self.message
    }
}

impl Drop for PooledMessage {
    fn drop(&mut self) {
        self.pool.release(std::mem::take(&mut self.message));
    }
}
