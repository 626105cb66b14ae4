//! Routes fan-out tasks to handlers by task kind.
//!
//! Concurrency is bounded twice: the subscription's flow-control cap limits
//! outstanding deliveries, and each spawned handler runs under a per-task
//! deadline. A timed-out remote call may still complete server-side, so
//! handlers must be safe to fire twice.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::timeout;
use tracing::{info, warn};

use citypulse_bus::{Delivery, Subscription};
use citypulse_common::{
    ActivityRecord, ActivityStatus, CityPulseError, FanOutTask, TaskKind,
};
use citypulse_store::RecordStore;

use crate::TaskHandler;

struct DispatcherInner {
    registry: HashMap<TaskKind, Arc<dyn TaskHandler>>,
    store: Arc<dyn RecordStore>,
    task_timeout: Duration,
}

#[derive(Clone)]
pub struct AgentDispatcher {
    inner: Arc<DispatcherInner>,
}

impl AgentDispatcher {
    pub fn new(
        registry: HashMap<TaskKind, Arc<dyn TaskHandler>>,
        store: Arc<dyn RecordStore>,
        task_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                store,
                task_timeout,
            }),
        }
    }

    /// Consume the subscription until the bus shuts down. Each delivery is
    /// handled on its own task; the flow-control cap bounds how many run
    /// at once.
    pub async fn run(&self, mut subscription: Box<dyn Subscription>) {
        info!("agent dispatcher listening for tasks");
        while let Some(delivery) = subscription.recv().await {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.handle_delivery(delivery).await;
            });
        }
        info!("agent task subscription closed, dispatcher stopping");
    }

    pub async fn handle_delivery(&self, delivery: Delivery) {
        let task: FanOutTask = match serde_json::from_value(delivery.payload.clone()) {
            Ok(task) => task,
            Err(e) => {
                // Could be a registry/version skew: a newer producer may
                // emit kinds this instance does not know. Nack rather than
                // drop so an updated dispatcher can pick it up.
                warn!(
                    error = %e,
                    message_id = %delivery.message_id,
                    "unknown or malformed task payload, nacking"
                );
                delivery.nack();
                return;
            }
        };

        match self.process(&task).await {
            Ok(()) => delivery.ack(),
            Err(e) => {
                warn!(
                    error = %e,
                    task_kind = %task.kind(),
                    attempt = delivery.attempt,
                    "task failed, nacking for redelivery"
                );
                delivery.nack();
            }
        }
    }

    /// Run one task through its handler and record the outcome.
    pub async fn process(&self, task: &FanOutTask) -> Result<()> {
        let kind = task.kind();
        let handler = self
            .inner
            .registry
            .get(&kind)
            .ok_or_else(|| CityPulseError::UnknownTaskKind(kind.to_string()))?
            .clone();

        let started = std::time::Instant::now();
        match timeout(self.inner.task_timeout, handler.handle(task)).await {
            Ok(Ok(detail)) => {
                info!(task_kind = %kind, agent = handler.name(), "task completed");
                self.record_activity(&*handler, task, ActivityStatus::Success, detail)
                    .await?;
                Ok(())
            }
            Ok(Err(e)) => {
                self.record_activity(
                    &*handler,
                    task,
                    ActivityStatus::Failure,
                    serde_json::json!({ "error": e.to_string() }),
                )
                .await?;
                Err(e)
            }
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                // Logged distinctly from ordinary failures: the work may
                // still finish remotely, so side effects can double-fire.
                warn!(
                    task_kind = %kind,
                    agent = handler.name(),
                    elapsed_ms,
                    "handler timeout"
                );
                self.record_activity(
                    &*handler,
                    task,
                    ActivityStatus::Failure,
                    serde_json::json!({ "error": "handler timeout", "elapsed_ms": elapsed_ms }),
                )
                .await?;
                Err(CityPulseError::HandlerTimeout {
                    task_kind: kind.to_string(),
                    elapsed_ms,
                }
                .into())
            }
        }
    }

    async fn record_activity(
        &self,
        handler: &dyn TaskHandler,
        task: &FanOutTask,
        status: ActivityStatus,
        detail: serde_json::Value,
    ) -> Result<()> {
        self.inner
            .store
            .append_activity(&ActivityRecord {
                agent_name: handler.name().to_string(),
                task_type: task.kind(),
                status,
                detail,
                timestamp: Utc::now(),
                incident_id: task.incident_id().map(str::to_string),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use citypulse_bus::{topics, EventBus, MemoryBus};
    use citypulse_common::SeverityLevel;
    use citypulse_store::testing::MemoryRecordStore;
    use serde_json::json;

    struct OkHandler;

    #[async_trait::async_trait]
    impl TaskHandler for OkHandler {
        fn name(&self) -> &'static str {
            "ok_agent"
        }

        async fn handle(&self, _task: &FanOutTask) -> Result<serde_json::Value> {
            Ok(json!({"done": true}))
        }
    }

    struct SlowHandler;

    #[async_trait::async_trait]
    impl TaskHandler for SlowHandler {
        fn name(&self) -> &'static str {
            "slow_agent"
        }

        async fn handle(&self, _task: &FanOutTask) -> Result<serde_json::Value> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({}))
        }
    }

    struct FailingHandler;

    #[async_trait::async_trait]
    impl TaskHandler for FailingHandler {
        fn name(&self) -> &'static str {
            "failing_agent"
        }

        async fn handle(&self, _task: &FanOutTask) -> Result<serde_json::Value> {
            anyhow::bail!("downstream unavailable")
        }
    }

    fn sample_task() -> FanOutTask {
        FanOutTask::ResourceAllocation {
            incident_id: "X1".to_string(),
            severity: SeverityLevel::Critical,
            estimated_duration: Some(120),
        }
    }

    fn dispatcher_with(
        handler: Arc<dyn TaskHandler>,
        store: Arc<MemoryRecordStore>,
        task_timeout: Duration,
    ) -> AgentDispatcher {
        let mut registry: HashMap<TaskKind, Arc<dyn TaskHandler>> = HashMap::new();
        registry.insert(TaskKind::ResourceAllocation, handler);
        AgentDispatcher::new(registry, store, task_timeout)
    }

    #[tokio::test]
    async fn successful_task_writes_one_success_activity() {
        let store = Arc::new(MemoryRecordStore::new());
        let dispatcher =
            dispatcher_with(Arc::new(OkHandler), store.clone(), Duration::from_secs(5));

        dispatcher.process(&sample_task()).await.unwrap();

        let activities = store.activities();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].status, ActivityStatus::Success);
        assert_eq!(activities[0].agent_name, "ok_agent");
        assert_eq!(activities[0].incident_id.as_deref(), Some("X1"));
    }

    #[tokio::test]
    async fn failing_task_writes_failure_activity_and_errors() {
        let store = Arc::new(MemoryRecordStore::new());
        let dispatcher = dispatcher_with(
            Arc::new(FailingHandler),
            store.clone(),
            Duration::from_secs(5),
        );

        let result = dispatcher.process(&sample_task()).await;
        assert!(result.is_err());

        let activities = store.activities();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].status, ActivityStatus::Failure);
    }

    #[tokio::test]
    async fn timed_out_handler_is_treated_as_failed() {
        let store = Arc::new(MemoryRecordStore::new());
        let dispatcher = dispatcher_with(
            Arc::new(SlowHandler),
            store.clone(),
            Duration::from_millis(50),
        );

        let err = dispatcher.process(&sample_task()).await.unwrap_err();
        let err = err.downcast::<CityPulseError>().unwrap();
        assert!(matches!(err, CityPulseError::HandlerTimeout { .. }));

        let activities = store.activities();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].status, ActivityStatus::Failure);
    }

    #[tokio::test]
    async fn unknown_task_kind_is_an_error() {
        let store = Arc::new(MemoryRecordStore::new());
        let dispatcher = AgentDispatcher::new(HashMap::new(), store, Duration::from_secs(5));

        let err = dispatcher.process(&sample_task()).await.unwrap_err();
        let err = err.downcast::<CityPulseError>().unwrap();
        assert!(matches!(err, CityPulseError::UnknownTaskKind(_)));
    }

    #[tokio::test]
    async fn malformed_payload_is_nacked_for_redelivery() {
        let bus = MemoryBus::new();
        bus.publish(topics::AGENT_TASKS, json!({"task_type": "time_travel"}))
            .await
            .unwrap();

        let store = Arc::new(MemoryRecordStore::new());
        let dispatcher =
            dispatcher_with(Arc::new(OkHandler), store.clone(), Duration::from_secs(5));

        let mut sub = bus.subscribe(topics::AGENT_TASKS, 10).await.unwrap();
        let delivery = sub.recv().await.unwrap();
        dispatcher.handle_delivery(delivery).await;

        // Nacked, so it comes back with a bumped attempt counter.
        let redelivered = sub.recv().await.unwrap();
        assert_eq!(redelivered.attempt, 2);
        assert!(store.activities().is_empty());
        redelivered.ack();
    }
}
