// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. Unparseable values fall back to their defaults.

use std::net::SocketAddr;

use crate::broker::{default_shard_count, BrokerConfig, DEFAULT_POOL_RETAIN};

pub const DEFAULT_PORT: u16 = 8443;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `fanout_relay=debug`).
    pub log_filter: String,
    /// Emit logs as JSON lines instead of text.
    pub log_json: bool,
    /// Largest inbound WebSocket frame or message accepted.
    pub max_frame_bytes: usize,
    pub shards: usize,
    pub pool_retain: usize,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `FANOUT_HOST` | `0.0.0.0` |
    /// | `FANOUT_PORT` | `8443` |
    /// | `FANOUT_SHARDS` | twice the available parallelism |
    /// | `FANOUT_POOL_RETAIN` | `1024` |
    /// | `FANOUT_MAX_FRAME_BYTES` | `262144` |
    /// | `FANOUT_LOG_FILTER` | `info` |
    /// | `FANOUT_LOG_JSON` | *(off)* |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let parsed = |key: &str| env(key).ok().and_then(|value| value.trim().parse::<usize>().ok());

        let host = env("FANOUT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("FANOUT_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let shards = parsed("FANOUT_SHARDS").unwrap_or_else(default_shard_count).max(1);
        let pool_retain = parsed("FANOUT_POOL_RETAIN").unwrap_or(DEFAULT_POOL_RETAIN);
        let max_frame_bytes = parsed("FANOUT_MAX_FRAME_BYTES")
            .filter(|bytes| *bytes > 0)
            .unwrap_or(DEFAULT_MAX_FRAME_BYTES);

        let log_filter = env("FANOUT_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_json = env("FANOUT_LOG_JSON")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        Self { listen_addr, log_filter, log_json, max_frame_bytes, shards, pool_retain }
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig { shards: self.shards, pool_retain: self.pool_retain }
    }
}
