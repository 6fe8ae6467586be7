use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pool::{Message, SharedMessage};
use super::registry::Registry;
use super::router::ShardRouter;
use crate::metrics::BrokerMetrics;

/// Outcome of one shard's pass over a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: u64,
    pub failed: u64,
}

/// A routed message and the signal fired once the dispatcher has taken it.
///
/// Senders wait on `taken`, which turns the single-slot queue into a
/// rendezvous: a handler never runs ahead of the dispatcher it feeds.
pub(crate) struct Handoff {
    pub(crate) message: SharedMessage,
    pub(crate) taken: oneshot::Sender<()>,
}

impl Handoff {
    pub(crate) fn new(message: SharedMessage) -> (Self, oneshot::Receiver<()>) {
        let (taken, accepted) = oneshot::channel();
        (Self { message, taken }, accepted)
    }
}

/// Everything one shard's dispatcher task needs.
pub(crate) struct Dispatcher {
    pub(crate) shard: usize,
    pub(crate) router: ShardRouter,
    pub(crate) registry: Arc<Registry>,
    pub(crate) metrics: Arc<BrokerMetrics>,
}

impl Dispatcher {
    /// Consumes the shard's inbound queue until `shutdown` fires or every
    /// sender is gone. A delivery pass already in progress is not interrupted.
    pub(crate) async fn run(
        self,
        mut inbound: mpsc::Receiver<Handoff>,
        shutdown: CancellationToken,
    ) {
        debug!(shard = self.shard, "dispatcher started");
        loop {
            let Handoff { message, taken } = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                received = inbound.recv() => match received {
                    Some(handoff) => handoff,
                    None => break,
                },
            };
            // The sender may have given up waiting; the message is still ours.
            let _ = taken.send(());

            let report = self.deliver(&message).await;
            self.metrics.record_delivery(report.delivered, report.failed);
            // Last holder returns the message to the pool here.
            drop(message);
        }
        info!(shard = self.shard, "dispatcher stopped");
    }

    /// Writes `message` to every connection in this shard it is addressed to:
    /// all devices of each receiver, and all devices of the sender except the
    /// originating one. Each connection is written at most once.
    pub(crate) async fn deliver(&self, message: &Message) -> DeliveryReport {
        let users = self.registry.all();
        let mut report = DeliveryReport::default();
        let mut seen = HashSet::with_capacity(message.receivers.len() + 1);

        let addressed = std::iter::once(message.sender.as_str())
            .chain(message.receivers.iter().map(String::as_str));
        for user_id in addressed {
            if self.router.shard_of(user_id) != self.shard || !seen.insert(user_id) {
                continue;
            }
            let Some(devices) = users.get(user_id) else {
                continue;
            };

            for (device_id, registration) in devices.iter() {
                if user_id == message.sender && *device_id == message.device {
                    continue;
                }
                match registration.connection.write_payload(message.encoded()).await {
                    Ok(()) => report.delivered += 1,
                    Err(error) => {
                        report.failed += 1;
                        warn!(
                            shard = self.shard,
                            user_id = %user_id,
                            device_id = %device_id,
                            sender = %message.sender,
                            error = %error,
                            "dropped message"
                        );
                    }
                }
            }
        }

        report
    }
}
