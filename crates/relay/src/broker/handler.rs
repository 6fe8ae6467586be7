use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use super::connection::ConnectionHandle;
use super::dispatcher::Handoff;
use super::registry::{ConnectionId, Registry};
use super::BrokerInner;

/// Read loop for one admitted connection.
pub(crate) struct ConnectionHandler {
    pub(crate) user_id: String,
    pub(crate) device_id: String,
    pub(crate) id: ConnectionId,
    pub(crate) connection: ConnectionHandle,
    pub(crate) broker: Arc<BrokerInner>,
}

impl ConnectionHandler {
    pub(crate) async fn run(self) {
        let shard = self.broker.router.shard_of(&self.user_id);
        let _leave = LeaveOnDrop {
            registry: Arc::clone(&self.broker.shards[shard].registry),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            id: self.id,
        };

        loop {
            let raw = match self.connection.read_payload().await {
                Ok(raw) => raw,
                Err(error) if error.is_closed() => {
                    debug!(user_id = %self.user_id, device_id = %self.device_id, "connection closed");
                    break;
                }
                Err(error) => {
                    warn!(
                        user_id = %self.user_id,
                        device_id = %self.device_id,
                        error = %error,
                        "read from websocket failed"
                    );
                    break;
                }
            };

            let mut message = self.broker.pool.acquire();
            if let Err(error) = message.decode_from(&raw) {
                self.broker.metrics.record_decode_error();
                warn!(
                    user_id = %self.user_id,
                    device_id = %self.device_id,
                    error = %error,
                    "failed to decode inbound frame"
                );
                break;
            }
            message.stamp(&self.user_id, &self.device_id, Utc::now().timestamp_millis());
            if let Err(error) = message.encode() {
                warn!(user_id = %self.user_id, error = %error, "failed to encode envelope");
                break;
            }
            self.broker.metrics.record_ingest();

            let targets = self.broker.router.route_targets(&self.user_id, &message.receivers);
            let message = message.into_shared();
            for target in targets {
                // Blocks until the shard's dispatcher takes the message; this is
                // the only backpressure.
                let (handoff, accepted) = Handoff::new(Arc::clone(&message));
                if self.broker.shards[target].inbound.send(handoff).await.is_err()
                    || accepted.await.is_err()
                {
                    debug!(shard = target, "dispatcher stopped, message not routed");
                    continue;
                }
                self.broker.metrics.record_shard_send();
            }
        }
    }
}

/// Removes this handler's registration however the read loop ends.
struct LeaveOnDrop {
    registry: Arc<Registry>,
    user_id: String,
    device_id: String,
    id: ConnectionId,
}

impl Drop for LeaveOnDrop {
    fn drop(&mut self) {
        self.registry.leave_connection(&self.user_id, &self.device_id, self.id);
    }
}
