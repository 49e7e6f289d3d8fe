//! Fan-out router: the per-instance consumer of the backplane channel.
//!
//! Every instance runs one router. All fan-out events flow through here,
//! including events published by this instance, so local and cross-instance
//! delivery are the same code path.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::points::leaderboard::LeaderboardEngine;

use super::backplane::{BackplaneAdapter, BackplaneEvent, CHANNEL_FANOUT};
use super::delivery::DeliveryPipeline;
use super::events::{EventName, OutboundEvent};
use super::presence::PresenceTracker;
use super::registry::ConnectionRegistry;

/// Entries included inline with a LEADERBOARD_UPDATED dispatch.
const LEADERBOARD_TOP_N: usize = 10;

pub struct FanoutRouter {
    registry: Arc<ConnectionRegistry>,
    presence: Arc<PresenceTracker>,
    delivery: Arc<DeliveryPipeline>,
    leaderboard: Arc<LeaderboardEngine>,
    backplane: Arc<BackplaneAdapter>,
}

impl FanoutRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
        delivery: Arc<DeliveryPipeline>,
        leaderboard: Arc<LeaderboardEngine>,
        backplane: Arc<BackplaneAdapter>,
    ) -> Self {
        Self {
            registry,
            presence,
            delivery,
            leaderboard,
            backplane,
        }
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    async fn run(self: Arc<Self>) {
        let mut rx = self.backplane.subscribe(CHANNEL_FANOUT).await;
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    let event: BackplaneEvent = match serde_json::from_str(&payload) {
                        Ok(event) => event,
                        Err(err) => {
                            tracing::warn!(%err, "unparseable backplane payload dropped");
                            continue;
                        }
                    };
                    self.route(event).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Reconciliation and reconnect flushes repair what we miss.
                    tracing::warn!(skipped, "fan-out router lagged behind backplane");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("backplane subscription closed, router stopping");
                    break;
                }
            }
        }
    }

    async fn route(&self, event: BackplaneEvent) {
        match event {
            BackplaneEvent::MessageSend { message } => {
                match self.delivery.deliver_local(&message).await {
                    Ok(true) => {}
                    Ok(false) => {
                        // Receiver not on this instance.
                    }
                    Err(err) => {
                        tracing::error!(%err, message_id = message.id, "local delivery failed");
                    }
                }
            }
            BackplaneEvent::MessageStatus {
                message_id,
                sender_id,
                status,
                read_at,
                ..
            } => {
                if self.registry.has_user(&sender_id) {
                    self.registry.send_to_user(
                        &sender_id,
                        OutboundEvent::new(
                            EventName::MESSAGE_STATUS_CHANGED,
                            json!({
                                "message_id": message_id,
                                "status": status,
                                "read_at": read_at,
                            }),
                        ),
                    );
                }
            }
            BackplaneEvent::Presence { user_id, status } => {
                self.presence.apply_remote(&user_id, &status);
                self.registry.broadcast_all(OutboundEvent::new(
                    EventName::PRESENCE_CHANGED,
                    json!({
                        "user_id": user_id,
                        "presence": status,
                    }),
                ));
            }
            BackplaneEvent::LeaderboardUpdated { period } => {
                let top = self.leaderboard.get(period, LEADERBOARD_TOP_N, 0);
                self.registry.broadcast_all(OutboundEvent::new(
                    EventName::LEADERBOARD_UPDATED,
                    json!({
                        "period": period,
                        "top": top,
                    }),
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::gateway::backplane::{BackoffPolicy, MemoryBackplane};
    use crate::gateway::events::SendMessagePayload;
    use crate::gateway::presence::PresenceStatus;
    use crate::stores::devices::MemoryDeviceDirectory;
    use crate::stores::message::MemoryMessageStore;
    use refurnish_common::SnowflakeGenerator;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;
    use tokio::time::timeout;

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        presence: Arc<PresenceTracker>,
        delivery: Arc<DeliveryPipeline>,
        leaderboard: Arc<LeaderboardEngine>,
        backplane: Arc<BackplaneAdapter>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(ConnectionRegistry::new());
        let presence = Arc::new(PresenceTracker::new());
        let leaderboard = Arc::new(LeaderboardEngine::new());
        let backplane = Arc::new(BackplaneAdapter::new(
            Arc::new(MemoryBackplane::new()),
            BackoffPolicy {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(50),
                max_attempts: 3,
            },
            64,
        ));
        let delivery = Arc::new(DeliveryPipeline::new(
            Arc::new(Config::for_tests()),
            Arc::new(SnowflakeGenerator::new(0)),
            registry.clone(),
            backplane.clone(),
            presence.clone(),
            Arc::new(MemoryMessageStore::new()),
            Arc::new(MemoryDeviceDirectory::new()),
        ));
        Harness {
            registry,
            presence,
            delivery,
            leaderboard,
            backplane,
        }
    }

    fn spawn_router(h: &Harness) -> JoinHandle<()> {
        Arc::new(FanoutRouter::new(
            h.registry.clone(),
            h.presence.clone(),
            h.delivery.clone(),
            h.leaderboard.clone(),
            h.backplane.clone(),
        ))
        .spawn()
    }

    #[tokio::test]
    async fn message_send_reaches_receiver_and_status_returns_to_sender() {
        let h = harness();
        let _router = spawn_router(&h);
        // Give the router time to subscribe before publishing.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx_a, mut rx_a) = unbounded_channel();
        let (tx_b, mut rx_b) = unbounded_channel();
        h.registry.register("usr_a", "cn_a", "inst_1", tx_a);
        h.registry.register("usr_b", "cn_b", "inst_1", tx_b);
        h.presence.connection_opened("usr_a");
        h.presence.connection_opened("usr_b");

        h.delivery
            .send_message(
                "usr_a",
                SendMessagePayload {
                    receiver_id: "usr_b".to_string(),
                    thread_id: "th_1".to_string(),
                    content: "is the couch still there?".to_string(),
                },
            )
            .await
            .unwrap();

        let received = timeout(Duration::from_secs(1), rx_b.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.event_name, EventName::MESSAGE_RECEIVED);

        let status = timeout(Duration::from_secs(1), rx_a.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.event_name, EventName::MESSAGE_STATUS_CHANGED);
        assert_eq!(status.data["status"], "delivered");
    }

    #[tokio::test]
    async fn presence_events_update_remote_view_and_broadcast() {
        let h = harness();
        let _router = spawn_router(&h);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let (tx, mut rx) = unbounded_channel();
        h.registry.register("usr_a", "cn_a", "inst_1", tx);

        h.backplane
            .publish_event(&BackplaneEvent::Presence {
                user_id: "usr_remote".to_string(),
                status: PresenceStatus::Online,
            })
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_name, EventName::PRESENCE_CHANGED);
        assert_eq!(event.data["user_id"], "usr_remote");
        assert!(h.presence.is_online_anywhere("usr_remote"));
    }

    #[tokio::test]
    async fn leaderboard_events_broadcast_the_top_slice() {
        let h = harness();
        let _router = spawn_router(&h);
        tokio::time::sleep(Duration::from_millis(20)).await;

        h.leaderboard.apply_delta("usr_a", 100, chrono::Utc::now());
        let (tx, mut rx) = unbounded_channel();
        h.registry.register("usr_b", "cn_b", "inst_1", tx);

        h.backplane
            .publish_event(&BackplaneEvent::LeaderboardUpdated {
                period: crate::models::leaderboard::Period::Daily,
            })
            .await
            .unwrap();

        let event = timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_name, EventName::LEADERBOARD_UPDATED);
        assert_eq!(event.data["period"], "daily");
        assert_eq!(event.data["top"][0]["user_id"], "usr_a");
    }
}
