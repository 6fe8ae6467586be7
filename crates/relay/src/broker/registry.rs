// Per-shard connection registry.
//
// Readers (the shard's dispatcher) load an immutable snapshot without taking
// a lock. Writers (join/leave) serialize on `writer`, build the next snapshot
// from the current one plus the delta, and swap it in. Only the touched
// user's device map is rebuilt; other users' maps are shared by `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::info;

use super::connection::ConnectionHandle;
use crate::metrics::BrokerMetrics;

/// Identifies one registration, so a replaced connection's cleanup cannot
/// evict its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Clone)]
pub struct Registration {
    pub id: ConnectionId,
    pub connection: ConnectionHandle,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration").field("id", &self.id).finish_non_exhaustive()
    }
}

pub type DeviceMap = HashMap<String, Registration>;
pub type UserMap = HashMap<String, Arc<DeviceMap>>;

pub struct Registry {
    snapshot: ArcSwap<UserMap>,
    writer: Mutex<()>,
    next_id: AtomicU64,
    metrics: Arc<BrokerMetrics>,
}

impl Registry {
    pub fn new(metrics: Arc<BrokerMetrics>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(()),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    /// Installs `connection` for `(user_id, device_id)`, closing whatever was
    /// registered for that pair before.
    pub fn join(&self, user_id: &str, device_id: &str, connection: ConnectionHandle) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let _writer = self.writer.lock();
        let current = self.snapshot.load_full();

        let mut devices = current.get(user_id).map(|devices| (**devices).clone()).unwrap_or_default();
        let previous = devices.insert(device_id.to_owned(), Registration { id, connection });
        if let Some(previous) = &previous {
            info!(user_id = %user_id, device_id = %device_id, "replacing registered connection");
            previous.connection.close();
        }

        let mut next = (*current).clone();
        next.insert(user_id.to_owned(), Arc::new(devices));
        self.snapshot.store(Arc::new(next));
        self.metrics.record_join(previous.is_some());
        id
    }

    /// Removes and closes the connection registered for the pair, if any.
    pub fn leave(&self, user_id: &str, device_id: &str) -> bool {
        self.remove_where(user_id, device_id, |_| true)
    }

    /// Like [`Registry::leave`], but only if the pair is still bound to `id`.
    pub fn leave_connection(&self, user_id: &str, device_id: &str, id: ConnectionId) -> bool {
        self.remove_where(user_id, device_id, |registration| registration.id == id)
    }

    fn remove_where<F>(&self, user_id: &str, device_id: &str, matches: F) -> bool
    where
        F: FnOnce(&Registration) -> bool,
    {
        let _writer = self.writer.lock();
        let current = self.snapshot.load_full();
        let Some(devices) = current.get(user_id) else {
            return false;
        };
        match devices.get(device_id) {
            Some(registration) if matches(registration) => {}
            _ => return false,
        }

        let mut devices = (**devices).clone();
        let removed = devices.remove(device_id);
        let mut next = (*current).clone();
        if devices.is_empty() {
            next.remove(user_id);
        } else {
            next.insert(user_id.to_owned(), Arc::new(devices));
        }
        self.snapshot.store(Arc::new(next));

        if let Some(removed) = removed {
            removed.connection.close();
            self.metrics.record_leave();
        }
        true
    }

    /// Removes and closes every registered connection.
    pub fn drain(&self) -> usize {
        let _writer = self.writer.lock();
        let previous = self.snapshot.swap(Arc::new(HashMap::new()));
        let mut closed = 0;
        for registration in previous.values().flat_map(|devices| devices.values()) {
            registration.connection.close();
            self.metrics.record_leave();
            closed += 1;
        }
        closed
    }

    pub fn devices_of(&self, user_id: &str) -> Option<Arc<DeviceMap>> {
        self.snapshot.load().get(user_id).cloned()
    }

    pub fn all(&self) -> Arc<UserMap> {
        self.snapshot.load_full()
    }

    /// Total registered connections across all users.
    pub fn len(&self) -> usize {
        self.snapshot.load().values().map(|devices| devices.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}
