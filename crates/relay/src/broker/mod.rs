// Sharded fan-out broker.
//
// Each user id hashes to one shard. A shard owns a registry of that shard's
// users' connections, an inbound hand-off queue, and a dispatcher task draining
// it. Connection handlers decode a frame, route it to the sender's shard and
// every receiver's shard, and wait until each shard's dispatcher has taken
// it. The dispatchers do the writing.

pub mod connection;
pub mod dispatcher;
pub mod handler;
pub mod pool;
pub mod registry;
pub mod router;
#[cfg(test)]
pub(crate) mod test_support;

use std::num::NonZeroUsize;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use self::connection::ConnectionHandle;
use self::dispatcher::{Dispatcher, Handoff};
use self::handler::ConnectionHandler;
use self::pool::MessagePool;
use self::registry::Registry;
use self::router::ShardRouter;
use crate::metrics::BrokerMetrics;

pub const DEFAULT_POOL_RETAIN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    pub shards: usize,
    pub pool_retain: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            shards: default_shard_count(),
            pool_retain: DEFAULT_POOL_RETAIN,
        }
    }
}

/// Twice the available parallelism.
pub fn default_shard_count() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get) * 2
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("broker is shutting down")]
    ShuttingDown,
}

pub(crate) struct Shard {
    pub(crate) registry: Arc<Registry>,
    /// Single-slot queue; a send completes only once the dispatcher acks
    /// the hand-off, so nothing is buffered ahead of it.
    pub(crate) inbound: mpsc::Sender<Handoff>,
}

pub(crate) struct BrokerInner {
    pub(crate) router: ShardRouter,
    pub(crate) shards: Vec<Shard>,
    pub(crate) pool: Arc<MessagePool>,
    pub(crate) metrics: Arc<BrokerMetrics>,
    shutdown: CancellationToken,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; every clone drives the same shards.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Builds the shards and spawns one dispatcher task per shard.
    ///
    /// Must be called from within a tokio runtime. A shard count of zero is
    /// raised to one.
    pub fn new(config: BrokerConfig) -> Self {
        let shard_count = NonZeroUsize::new(config.shards).unwrap_or(NonZeroUsize::MIN);
        let router = ShardRouter::new(shard_count);
        let metrics = Arc::new(BrokerMetrics::default());
        let pool = MessagePool::new(config.pool_retain, Arc::clone(&metrics));
        let shutdown = CancellationToken::new();

        let mut shards = Vec::with_capacity(shard_count.get());
        let mut dispatchers = Vec::with_capacity(shard_count.get());
        for shard in 0..shard_count.get() {
            let registry = Arc::new(Registry::new(Arc::clone(&metrics)));
            let (inbound, receiver) = mpsc::channel(1);
            let dispatcher = Dispatcher {
                shard,
                router,
                registry: Arc::clone(&registry),
                metrics: Arc::clone(&metrics),
            };
            dispatchers.push(tokio::spawn(dispatcher.run(receiver, shutdown.clone())));
            shards.push(Shard { registry, inbound });
        }

        info!(shards = shard_count.get(), "broker started");
        Self {
            inner: Arc::new(BrokerInner {
                router,
                shards,
                pool,
                metrics,
                shutdown,
                dispatchers: Mutex::new(dispatchers),
            }),
        }
    }

    /// Registers `connection` as `(user_id, device_id)` and starts its read
    /// loop. Any connection already registered for the pair is closed.
    ///
    /// After [`Broker::shutdown`] the connection is closed and rejected.
    pub fn admit(
        &self,
        user_id: &str,
        device_id: &str,
        connection: ConnectionHandle,
    ) -> Result<JoinHandle<()>, AdmitError> {
        if self.inner.shutdown.is_cancelled() {
            connection.close();
            return Err(AdmitError::ShuttingDown);
        }

        let shard = self.inner.router.shard_of(user_id);
        let registry = &self.inner.shards[shard].registry;
        let id = registry.join(user_id, device_id, Arc::clone(&connection));
        // A shutdown and drain that ran since the first check missed this entry.
        if self.inner.shutdown.is_cancelled() {
            registry.leave_connection(user_id, device_id, id);
            return Err(AdmitError::ShuttingDown);
        }
        info!(user_id = %user_id, device_id = %device_id, shard, connection_id = id.get(), "connection admitted");

        let handler = ConnectionHandler {
            user_id: user_id.to_owned(),
            device_id: device_id.to_owned(),
            id,
            connection,
            broker: Arc::clone(&self.inner),
        };
        Ok(tokio::spawn(handler.run()))
    }

    /// Stops every dispatcher. Messages still queued are discarded. Idempotent.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("broker shutting down");
        }
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Waits for the dispatcher tasks to exit after [`Broker::shutdown`].
    pub async fn join(&self) {
        let dispatchers = std::mem::take(&mut *self.inner.dispatchers.lock());
        for dispatcher in dispatchers {
            if let Err(error) = dispatcher.await {
                warn!(error = %error, "dispatcher task failed");
            }
        }
    }

    /// Closes and unregisters every connection. Their handlers exit on their own.
    pub fn drain(&self) -> usize {
        let closed = self.inner.shards.iter().map(|shard| shard.registry.drain()).sum();
        info!(closed, "drained connections");
        closed
    }

    /// Device ids currently registered for `user_id`, sorted.
    pub fn devices_of(&self, user_id: &str) -> Vec<String> {
        let shard = self.inner.router.shard_of(user_id);
        let mut devices = self.inner.shards[shard]
            .registry
            .devices_of(user_id)
            .map(|devices| devices.keys().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        devices.sort();
        devices
    }

    pub fn connection_count(&self) -> usize {
        self.inner.shards.iter().map(|shard| shard.registry.len()).sum()
    }

    pub fn shard_count(&self) -> usize {
        self.inner.router.shard_count()
    }

    pub fn shard_of(&self, user_id: &str) -> usize {
        self.inner.router.shard_of(user_id)
    }

    pub fn metrics(&self) -> &BrokerMetrics {
        &self.inner.metrics
    }

    pub fn pool(&self) -> &MessagePool {
        &self.inner.pool
    }
}
