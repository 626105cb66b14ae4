//! In-process bus with real at-least-once semantics.
//!
//! Each topic is a work queue: subscriptions on the same topic compete for
//! messages. Redelivery happens on explicit nack, on dropping a delivery
//! without acking, and on lease expiry. Messages past the attempt cap are
//! dead-lettered to the log — the stand-in for an external dead-letter
//! policy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{EventBus, MessageId, Subscription};

#[derive(Debug, Clone, Copy)]
pub struct MemoryBusConfig {
    /// How long a delivery may stay unacknowledged before redelivery.
    pub lease: Duration,
    /// Delivery attempts before a message is dead-lettered.
    pub max_attempts: u32,
}

impl Default for MemoryBusConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

#[derive(Clone)]
struct QueuedMessage {
    id: MessageId,
    attempt: u32,
    payload: serde_json::Value,
}

struct TopicChannel {
    tx: UnboundedSender<QueuedMessage>,
    rx: Arc<tokio::sync::Mutex<UnboundedReceiver<QueuedMessage>>>,
}

pub struct MemoryBus {
    topics: Mutex<HashMap<String, TopicChannel>>,
    config: MemoryBusConfig,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::with_config(MemoryBusConfig::default())
    }

    pub fn with_config(config: MemoryBusConfig) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn channel(&self, topic: &str) -> (UnboundedSender<QueuedMessage>, Arc<tokio::sync::Mutex<UnboundedReceiver<QueuedMessage>>>) {
        let mut topics = self.topics.lock().expect("topics lock poisoned");
        let channel = topics.entry(topic.to_string()).or_insert_with(|| {
            let (tx, rx) = unbounded_channel();
            TopicChannel {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            }
        });
        (channel.tx.clone(), channel.rx.clone())
    }
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EventBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<MessageId> {
        let (tx, _) = self.channel(topic);
        let id = Uuid::new_v4();
        let message = QueuedMessage {
            id,
            attempt: 1,
            payload,
        };
        tx.send(message)
            .map_err(|_| anyhow::anyhow!("topic {topic} closed"))?;
        debug!(topic, message_id = %id, "published");
        Ok(id)
    }

    async fn subscribe(&self, topic: &str, max_in_flight: usize) -> Result<Box<dyn Subscription>> {
        let (tx, rx) = self.channel(topic);

        let shared = Arc::new(SubShared {
            topic: topic.to_string(),
            requeue_tx: tx,
            in_flight: Mutex::new(HashMap::new()),
            config: self.config,
        });

        let reaper = spawn_lease_reaper(shared.clone());

        Ok(Box::new(MemorySubscription {
            shared,
            rx,
            permits: Arc::new(Semaphore::new(max_in_flight)),
            reaper,
        }))
    }
}

// --- Subscription internals ---

struct InFlightEntry {
    attempt: u32,
    payload: serde_json::Value,
    deadline: Instant,
}

struct SubShared {
    topic: String,
    requeue_tx: UnboundedSender<QueuedMessage>,
    in_flight: Mutex<HashMap<MessageId, InFlightEntry>>,
    config: MemoryBusConfig,
}

impl SubShared {
    /// Push a message back on the queue for another attempt, or dead-letter
    /// it once the attempt cap is reached.
    fn requeue(&self, id: MessageId, attempt: u32, payload: serde_json::Value) {
        let next_attempt = attempt + 1;
        if next_attempt > self.config.max_attempts {
            warn!(
                topic = %self.topic,
                message_id = %id,
                attempts = attempt,
                "message exhausted delivery attempts, dead-lettered"
            );
            return;
        }
        let message = QueuedMessage {
            id,
            attempt: next_attempt,
            payload,
        };
        if self.requeue_tx.send(message).is_err() {
            warn!(topic = %self.topic, message_id = %id, "requeue failed, topic closed");
        }
    }
}

struct MemorySubscription {
    shared: Arc<SubShared>,
    rx: Arc<tokio::sync::Mutex<UnboundedReceiver<QueuedMessage>>>,
    permits: Arc<Semaphore>,
    reaper: JoinHandle<()>,
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.reaper.abort();
    }
}

#[async_trait::async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Option<Delivery> {
        let permit = self.permits.clone().acquire_owned().await.ok()?;
        let message = { self.rx.lock().await.recv().await? };

        let deadline = Instant::now() + self.shared.config.lease;
        self.shared
            .in_flight
            .lock()
            .expect("in_flight lock poisoned")
            .insert(
                message.id,
                InFlightEntry {
                    attempt: message.attempt,
                    payload: message.payload.clone(),
                    deadline,
                },
            );

        Some(Delivery {
            message_id: message.id,
            attempt: message.attempt,
            payload: message.payload,
            state: Some(AckState {
                shared: self.shared.clone(),
                _permit: permit,
            }),
        })
    }
}

fn spawn_lease_reaper(shared: Arc<SubShared>) -> JoinHandle<()> {
    let interval = shared.config.lease / 4;
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval.max(Duration::from_millis(10)));
        loop {
            tick.tick().await;
            let now = Instant::now();
            let expired: Vec<(MessageId, u32, serde_json::Value)> = {
                let mut in_flight = shared.in_flight.lock().expect("in_flight lock poisoned");
                let ids: Vec<MessageId> = in_flight
                    .iter()
                    .filter(|(_, entry)| entry.deadline <= now)
                    .map(|(id, _)| *id)
                    .collect();
                ids.into_iter()
                    .filter_map(|id| {
                        in_flight
                            .remove(&id)
                            .map(|entry| (id, entry.attempt, entry.payload))
                    })
                    .collect()
            };
            for (id, attempt, payload) in expired {
                debug!(topic = %shared.topic, message_id = %id, attempt, "lease expired, redelivering");
                shared.requeue(id, attempt, payload);
            }
        }
    })
}

// --- Delivery ---

struct AckState {
    shared: Arc<SubShared>,
    // Held until ack/nack/drop; releasing it opens a flow-control slot.
    _permit: OwnedSemaphorePermit,
}

/// A single at-least-once delivery. Ack on success; nack (or drop) to
/// request redelivery. `attempt` starts at 1.
pub struct Delivery {
    pub message_id: MessageId,
    pub attempt: u32,
    pub payload: serde_json::Value,
    state: Option<AckState>,
}

impl Delivery {
    pub fn ack(mut self) {
        if let Some(state) = self.state.take() {
            state
                .shared
                .in_flight
                .lock()
                .expect("in_flight lock poisoned")
                .remove(&self.message_id);
        }
    }

    pub fn nack(mut self) {
        if let Some(state) = self.state.take() {
            let removed = state
                .shared
                .in_flight
                .lock()
                .expect("in_flight lock poisoned")
                .remove(&self.message_id);
            // If the lease reaper already requeued this message, a second
            // requeue here would duplicate it beyond at-least-once needs.
            if removed.is_some() {
                state
                    .shared
                    .requeue(self.message_id, self.attempt, self.payload.clone());
            }
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            let removed = state
                .shared
                .in_flight
                .lock()
                .expect("in_flight lock poisoned")
                .remove(&self.message_id);
            if removed.is_some() {
                debug!(
                    topic = %state.shared.topic,
                    message_id = %self.message_id,
                    "delivery dropped without ack, requeueing"
                );
                state
                    .shared
                    .requeue(self.message_id, self.attempt, self.payload.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics;
    use serde_json::json;
    use tokio::time::timeout;

    fn fast_bus() -> MemoryBus {
        MemoryBus::with_config(MemoryBusConfig {
            lease: Duration::from_millis(80),
            max_attempts: 5,
        })
    }

    #[tokio::test]
    async fn publish_and_receive() {
        let bus = MemoryBus::new();
        bus.publish(topics::INCIDENT_STREAM, json!({"id": "X1"}))
            .await
            .unwrap();

        let mut sub = bus.subscribe(topics::INCIDENT_STREAM, 10).await.unwrap();
        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.payload["id"], "X1");
        assert_eq!(delivery.attempt, 1);
        delivery.ack();
    }

    #[tokio::test]
    async fn acked_message_is_not_redelivered() {
        let bus = fast_bus();
        bus.publish("t", json!(1)).await.unwrap();

        let mut sub = bus.subscribe("t", 10).await.unwrap();
        sub.recv().await.unwrap().ack();

        let next = timeout(Duration::from_millis(250), sub.recv()).await;
        assert!(next.is_err(), "ack should be final");
    }

    #[tokio::test]
    async fn nack_redelivers_with_incremented_attempt() {
        let bus = MemoryBus::new();
        bus.publish("t", json!(1)).await.unwrap();

        let mut sub = bus.subscribe("t", 10).await.unwrap();
        let first = sub.recv().await.unwrap();
        let id = first.message_id;
        first.nack();

        let second = sub.recv().await.unwrap();
        assert_eq!(second.message_id, id);
        assert_eq!(second.attempt, 2);
        second.ack();
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let bus = MemoryBus::new();
        bus.publish("t", json!(1)).await.unwrap();

        let mut sub = bus.subscribe("t", 10).await.unwrap();
        drop(sub.recv().await.unwrap());

        let second = sub.recv().await.unwrap();
        assert_eq!(second.attempt, 2);
        second.ack();
    }

    #[tokio::test]
    async fn lease_expiry_redelivers_while_original_is_held() {
        let bus = fast_bus();
        bus.publish("t", json!(1)).await.unwrap();

        let mut sub = bus.subscribe("t", 10).await.unwrap();
        let held = sub.recv().await.unwrap();

        // Past the lease window the reaper requeues a copy.
        let redelivered = timeout(Duration::from_millis(500), sub.recv())
            .await
            .expect("lease expiry should redeliver")
            .unwrap();
        assert_eq!(redelivered.message_id, held.message_id);
        assert_eq!(redelivered.attempt, 2);

        redelivered.ack();
        // A late ack of the expired delivery must be a harmless no-op.
        held.ack();
    }

    #[tokio::test]
    async fn flow_control_caps_in_flight_deliveries() {
        let bus = MemoryBus::new();
        bus.publish("t", json!(1)).await.unwrap();
        bus.publish("t", json!(2)).await.unwrap();

        let mut sub = bus.subscribe("t", 1).await.unwrap();
        let first = sub.recv().await.unwrap();

        let blocked = timeout(Duration::from_millis(100), sub.recv()).await;
        assert!(blocked.is_err(), "second recv must wait for the ack");

        first.ack();
        let second = timeout(Duration::from_millis(500), sub.recv())
            .await
            .expect("slot should open after ack")
            .unwrap();
        second.ack();
    }

    #[tokio::test]
    async fn message_exhausting_attempts_is_dead_lettered() {
        let bus = MemoryBus::with_config(MemoryBusConfig {
            lease: Duration::from_secs(30),
            max_attempts: 2,
        });
        bus.publish("t", json!(1)).await.unwrap();

        let mut sub = bus.subscribe("t", 10).await.unwrap();
        sub.recv().await.unwrap().nack(); // attempt 1 -> requeued as 2
        sub.recv().await.unwrap().nack(); // attempt 2 -> dead-lettered

        let next = timeout(Duration::from_millis(200), sub.recv()).await;
        assert!(next.is_err(), "dead-lettered message must not come back");
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = MemoryBus::new();
        bus.publish("a", json!("for-a")).await.unwrap();

        let mut sub_b = bus.subscribe("b", 10).await.unwrap();
        let nothing = timeout(Duration::from_millis(100), sub_b.recv()).await;
        assert!(nothing.is_err());

        let mut sub_a = bus.subscribe("a", 10).await.unwrap();
        let delivery = sub_a.recv().await.unwrap();
        assert_eq!(delivery.payload, json!("for-a"));
        delivery.ack();
    }
}
