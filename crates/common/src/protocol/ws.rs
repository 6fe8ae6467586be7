// WebSocket envelope exchanged with clients.
//
// Clients send an object carrying `payload` and `receivers`. The relay
// discards any client-supplied `timestamp`, `sender` and `device`, stamps its
// own, and writes the full envelope to every destination connection.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Field names of the envelope, in the order the relay writes them.
pub const ENVELOPE_FIELDS: [&str; 5] = ["timestamp", "device", "sender", "payload", "receivers"];

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame must be a JSON object")]
    NotAnObject,
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// Client -> Server: borrowed view of one inbound frame.
///
/// `payload` stays as raw JSON text and is passed through unmodified.
#[derive(Debug, Deserialize)]
pub struct InboundFrame<'a> {
    #[serde(borrow, default)]
    pub payload: Option<&'a RawValue>,
    #[serde(default)]
    pub receivers: Vec<String>,
}

/// Server -> Client: the envelope as written by a dispatcher.
#[derive(Debug, Serialize)]
pub struct OutboundFrame<'a> {
    pub timestamp: i64,
    pub device: &'a str,
    pub sender: &'a str,
    pub payload: Option<&'a RawValue>,
    pub receivers: &'a [String],
}

/// Owned envelope, for clients reading what the relay delivers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub timestamp: i64,
    pub device: String,
    pub sender: String,
    pub payload: Option<Box<RawValue>>,
    #[serde(default)]
    pub receivers: Vec<String>,
}

impl WireMessage {
    /// Parses the delivered `payload` into a JSON value.
    pub fn payload_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match &self.payload {
            Some(raw) => serde_json::from_str(raw.get()),
            None => Ok(serde_json::Value::Null),
        }
    }
}

pub fn decode_inbound(raw: &[u8]) -> Result<InboundFrame<'_>, FrameError> {
    // serde_json would happily map a positional array onto the struct.
    match raw.iter().find(|byte| !byte.is_ascii_whitespace()) {
        Some(b'{') => Ok(serde_json::from_slice(raw)?),
        _ => Err(FrameError::NotAnObject),
    }
}

/// Encodes `frame` into `buf`, replacing its previous contents.
pub fn encode_outbound_into(frame: &OutboundFrame<'_>, buf: &mut Vec<u8>) -> serde_json::Result<()> {
    buf.clear();
    serde_json::to_writer(buf, frame)
}
