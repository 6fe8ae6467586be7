use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Counters for one broker instance, rendered at `GET /metrics`.
#[derive(Debug, Default)]
pub struct BrokerMetrics {
    connections_active: AtomicI64,
    connections_joined_total: AtomicU64,
    connections_replaced_total: AtomicU64,
    connections_left_total: AtomicU64,
    messages_ingested_total: AtomicU64,
    message_decode_errors_total: AtomicU64,
    shard_sends_total: AtomicU64,
    deliveries_total: AtomicU64,
    delivery_failures_total: AtomicU64,
    pool_reused_total: AtomicU64,
    pool_allocated_total: AtomicU64,
    pool_released_total: AtomicU64,
}

/// Point-in-time copy of [`BrokerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_active: i64,
    pub connections_joined_total: u64,
    pub connections_replaced_total: u64,
    pub connections_left_total: u64,
    pub messages_ingested_total: u64,
    pub message_decode_errors_total: u64,
    pub shard_sends_total: u64,
    pub deliveries_total: u64,
    pub delivery_failures_total: u64,
    pub pool_reused_total: u64,
    pub pool_allocated_total: u64,
    pub pool_released_total: u64,
}

impl BrokerMetrics {
    pub fn record_join(&self, replaced: bool) {
        self.connections_joined_total.fetch_add(1, Ordering::Relaxed);
        if replaced {
            self.connections_replaced_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.connections_active.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_leave(&self) {
        self.connections_left_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_ingest(&self) {
        self.messages_ingested_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.message_decode_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shard_send(&self) {
        self.shard_sends_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivery(&self, delivered: u64, failed: u64) {
        self.deliveries_total.fetch_add(delivered, Ordering::Relaxed);
        self.delivery_failures_total.fetch_add(failed, Ordering::Relaxed);
    }

    pub fn record_pool_acquire(&self, reused: bool) {
        if reused {
            self.pool_reused_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.pool_allocated_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_pool_release(&self) {
        self.pool_released_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_joined_total: self.connections_joined_total.load(Ordering::Relaxed),
            connections_replaced_total: self.connections_replaced_total.load(Ordering::Relaxed),
            connections_left_total: self.connections_left_total.load(Ordering::Relaxed),
            messages_ingested_total: self.messages_ingested_total.load(Ordering::Relaxed),
            message_decode_errors_total: self.message_decode_errors_total.load(Ordering::Relaxed),
            shard_sends_total: self.shard_sends_total.load(Ordering::Relaxed),
            deliveries_total: self.deliveries_total.load(Ordering::Relaxed),
            delivery_failures_total: self.delivery_failures_total.load(Ordering::Relaxed),
            pool_reused_total: self.pool_reused_total.load(Ordering::Relaxed),
            pool_allocated_total: self.pool_allocated_total.load(Ordering::Relaxed),
            pool_released_total: self.pool_released_total.load(Ordering::Relaxed),
        }
    }

    pub fn render_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        append_metric(
            &mut output,
            "fanout_connections_active",
            "gauge",
            "Currently registered device connections.",
            snapshot.connections_active.max(0) as u64,
        );
        append_metric(
            &mut output,
            "fanout_connections_joined_total",
            "counter",
            "Device connections admitted into a shard registry.",
            snapshot.connections_joined_total,
        );
        append_metric(
            &mut output,
            "fanout_connections_replaced_total",
            "counter",
            "Joins that closed a previous connection for the same user and device.",
            snapshot.connections_replaced_total,
        );
        append_metric(
            &mut output,
            "fanout_connections_left_total",
            "counter",
            "Device connections removed from a shard registry.",
            snapshot.connections_left_total,
        );
        append_metric(
            &mut output,
            "fanout_messages_ingested_total",
            "counter",
            "Inbound frames decoded and routed to shards.",
            snapshot.messages_ingested_total,
        );
        append_metric(
            &mut output,
            "fanout_message_decode_errors_total",
            "counter",
            "Inbound frames that failed to decode.",
            snapshot.message_decode_errors_total,
        );
        append_metric(
            &mut output,
            "fanout_shard_sends_total",
            "counter",
            "Messages handed to a shard inbound queue.",
            snapshot.shard_sends_total,
        );
        append_metric(
            &mut output,
            "fanout_deliveries_total",
            "counter",
            "Successful writes to destination connections.",
            snapshot.deliveries_total,
        );
        append_metric(
            &mut output,
            "fanout_delivery_failures_total",
            "counter",
            "Writes to destination connections that failed and were dropped.",
            snapshot.delivery_failures_total,
        );
        append_metric(
            &mut output,
            "fanout_pool_reused_total",
            "counter",
            "Message acquisitions served from the idle pool.",
            snapshot.pool_reused_total,
        );
        append_metric(
            &mut output,
            "fanout_pool_allocated_total",
            "counter",
            "Message acquisitions that allocated a fresh message.",
            snapshot.pool_allocated_total,
        );
        append_metric(
            &mut output,
            "fanout_pool_released_total",
            "counter",
            "Messages returned to the pool after fan-out completed.",
            snapshot.pool_released_total,
        );

        output
    }
}

fn append_metric(output: &mut String, name: &str, kind: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} {kind}\n"));
    output.push_str(&format!("{name} {value}\n"));
}
