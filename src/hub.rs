//! Fan-out of snapshots to connected subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::HubConfig;
use crate::error::{EngineError, EngineResult};
use crate::telemetry::MetricSnapshot;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: u64,
    pub connected_at: DateTime<Utc>,
    pub remote_address: Option<String>,
}

/// Line pushed to a subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    Connected {
        subscriber_id: u64,
        connected_at: DateTime<Utc>,
    },
    Snapshot(MetricSnapshot),
    /// Last line on a stream the hub has dropped.
    Closed { subscriber_id: u64 },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    pub active: usize,
    pub total_connected: u64,
    pub total_disconnected: u64,
    pub total_dropped: u64,
    pub messages_delivered: u64,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: Vec<u64>,
}

#[derive(Debug)]
struct Registered {
    info: Subscriber,
    tx: mpsc::Sender<HubMessage>,
}

#[derive(Debug, Default)]
struct HubState {
    subscribers: BTreeMap<u64, Registered>,
    stats: HubStats,
}

/// Subscriber registry. The lock is held across a whole broadcast, so
/// connect and disconnect never interleave with fan-out.
pub struct BroadcastHub {
    config: HubConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<HubState>,
    next_id: AtomicU64,
}

impl BroadcastHub {
    pub fn new(config: HubConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(HubState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber. The connection acknowledgement is already
    /// queued on the returned receiver.
    pub async fn connect(
        &self,
        remote_address: Option<String>,
    ) -> EngineResult<(Subscriber, mpsc::Receiver<HubMessage>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let info = Subscriber {
            id,
            connected_at: self.clock.now(),
            remote_address,
        };
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        tx.try_send(HubMessage::Connected {
            subscriber_id: id,
            connected_at: info.connected_at,
        })
        .map_err(|e| EngineError::DeliveryFailure {
            subscriber_id: id,
            reason: e.to_string(),
        })?;

        let mut state = self.state.lock().await;
        state.subscribers.insert(
            id,
            Registered {
                info: info.clone(),
                tx,
            },
        );
        state.stats.total_connected += 1;
        state.stats.active = state.subscribers.len();
        info!("👂 Subscriber {} connected ({} active)", id, state.subscribers.len());

        Ok((info, rx))
    }

    /// Remove a subscriber. Returns whether it was registered; a second call
    /// is a no-op.
    pub async fn disconnect(&self, id: u64) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.subscribers.remove(&id).is_some();
        if removed {
            state.stats.total_disconnected += 1;
            state.stats.active = state.subscribers.len();
            info!("🔌 Subscriber {} disconnected", id);
        }
        removed
    }

    /// Deliver `message` to every subscriber. Subscribers whose channel is
    /// closed or stays full past the send deadline are removed.
    pub async fn broadcast(&self, message: &HubMessage) -> BroadcastReport {
        let send_timeout = self.config.send_timeout();
        let mut state = self.state.lock().await;
        let mut report = BroadcastReport::default();

        for (id, registered) in &state.subscribers {
            let failure = match timeout(send_timeout, registered.tx.send(message.clone())).await {
                Ok(Ok(())) => None,
                Ok(Err(_)) => Some("channel closed".to_string()),
                Err(_) => Some(format!("send timed out after {:?}", send_timeout)),
            };
            match failure {
                None => report.delivered += 1,
                Some(reason) => {
                    let err = EngineError::DeliveryFailure {
                        subscriber_id: *id,
                        reason,
                    };
                    warn!("📵 {}; dropping subscriber", err);
                    report.dropped.push(*id);
                }
            }
        }

        for id in &report.dropped {
            state.subscribers.remove(id);
        }
        state.stats.total_dropped += report.dropped.len() as u64;
        state.stats.messages_delivered += report.delivered as u64;
        state.stats.active = state.subscribers.len();
        debug!(
            "broadcast delivered to {}, dropped {}",
            report.delivered,
            report.dropped.len()
        );
        report
    }

    pub async fn is_connected(&self, id: u64) -> bool {
        self.state.lock().await.subscribers.contains_key(&id)
    }

    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    pub async fn subscribers(&self) -> Vec<Subscriber> {
        self.state
            .lock()
            .await
            .subscribers
            .values()
            .map(|registered| registered.info.clone())
            .collect()
    }

    pub async fn stats(&self) -> HubStats {
        self.state.lock().await.stats.clone()
    }
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastHub")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::store::StatusCounts;

    fn hub(capacity: usize) -> BroadcastHub {
        BroadcastHub::new(
            HubConfig {
                channel_capacity: capacity,
                send_timeout_ms: 50,
            },
            Arc::new(SystemClock),
        )
    }

    fn snapshot() -> HubMessage {
        HubMessage::Snapshot(MetricSnapshot::empty(Utc::now(), StatusCounts::default()))
    }

    #[tokio::test]
    async fn test_connect_queues_acknowledgement() {
        let hub = hub(4);
        let (subscriber, mut rx) = hub.connect(Some("10.0.0.1:5000".to_string())).await.unwrap();
        match rx.recv().await {
            Some(HubMessage::Connected { subscriber_id, .. }) => assert_eq!(subscriber_id, subscriber.id),
            other => panic!("expected ack, got {:?}", other),
        }
        assert_eq!(hub.subscriber_count().await, 1);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let hub = hub(4);
        let (subscriber, _rx) = hub.connect(None).await.unwrap();
        assert!(hub.disconnect(subscriber.id).await);
        assert!(!hub.disconnect(subscriber.id).await);
        assert_eq!(hub.subscriber_count().await, 0);
        assert_eq!(hub.stats().await.total_disconnected, 1);
    }

    #[tokio::test]
    async fn test_closed_subscriber_dropped_others_served() {
        let hub = hub(4);
        let (_, mut alive) = hub.connect(None).await.unwrap();
        let (gone, dead) = hub.connect(None).await.unwrap();
        drop(dead);

        let report = hub.broadcast(&snapshot()).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, vec![gone.id]);
        assert_eq!(hub.subscriber_count().await, 1);

        assert!(matches!(alive.recv().await, Some(HubMessage::Connected { .. })));
        assert!(matches!(alive.recv().await, Some(HubMessage::Snapshot(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_subscriber_times_out() {
        // Capacity 1 is taken by the ack, so the first broadcast cannot land
        let hub = hub(1);
        let (stalled, _rx) = hub.connect(None).await.unwrap();
        let report = hub.broadcast(&snapshot()).await;
        assert_eq!(report.dropped, vec![stalled.id]);
        assert_eq!(hub.stats().await.total_dropped, 1);
        assert!(!hub.is_connected(stalled.id).await);
    }

    #[test]
    fn test_message_wire_shape() {
        let ack = HubMessage::Connected {
            subscriber_id: 7,
            connected_at: Utc::now(),
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["type"], "connected");
        assert_eq!(json["subscriber_id"], 7);

        let json = serde_json::to_value(snapshot()).unwrap();
        assert_eq!(json["type"], "snapshot");
        assert_eq!(json["summary"]["overall_health"], "healthy");

        let json = serde_json::to_value(HubMessage::Closed { subscriber_id: 7 }).unwrap();
        assert_eq!(json, serde_json::json!({ "type": "closed", "subscriber_id": 7 }));
    }
}
