//! Publish/subscribe transport with at-least-once delivery.
//!
//! No ordering guarantee between messages. A delivery not acked within the
//! lease window is redelivered with an incremented attempt counter, so
//! consumers must be idempotent. Flow control caps the number of
//! unacknowledged in-flight deliveries per subscription.

use anyhow::Result;
use uuid::Uuid;

pub mod memory;

pub use memory::{Delivery, MemoryBus, MemoryBusConfig};

pub type MessageId = Uuid;

/// Logical topic names, stable across the system.
pub mod topics {
    pub const INCIDENT_STREAM: &str = "incident-stream";
    pub const NOTIFICATION_STREAM: &str = "notification-stream";
    pub const ANALYTICS_STREAM: &str = "analytics-stream";
    pub const AGENT_TASKS: &str = "agent-tasks";
}

#[async_trait::async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<MessageId>;

    /// Open a subscription with at most `max_in_flight` unacknowledged
    /// deliveries outstanding at once.
    async fn subscribe(&self, topic: &str, max_in_flight: usize) -> Result<Box<dyn Subscription>>;
}

#[async_trait::async_trait]
pub trait Subscription: Send {
    /// Next delivery. Blocks while the flow-control cap is reached or the
    /// topic is empty. Returns `None` when the bus has shut down.
    async fn recv(&mut self) -> Option<Delivery>;
}
