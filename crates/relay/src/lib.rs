//! Sharded real-time fan-out relay.
//!
//! Clients connect over WebSocket as a `(user, device)` pair and send JSON
//! frames naming receiver users. Each frame is delivered to every device of
//! every receiver and to the sender's other devices.

pub mod broker;
pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod ws;

pub use broker::{AdmitError, Broker, BrokerConfig};
pub use config::RelayConfig;
