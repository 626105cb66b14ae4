//! Resource allocation recommendations from current department load.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;

use citypulse_ai::InsightModel;
use citypulse_common::{FanOutTask, SeverityLevel};
use citypulse_store::{RecentFilter, RecordStore};

use crate::{stats, TaskHandler};

const LOAD_WINDOW_HOURS: i64 = 24;
const LOAD_QUERY_LIMIT: i64 = 500;

pub struct ResourceAllocationHandler {
    store: Arc<dyn RecordStore>,
    insight: Arc<dyn InsightModel>,
}

impl ResourceAllocationHandler {
    pub fn new(store: Arc<dyn RecordStore>, insight: Arc<dyn InsightModel>) -> Self {
        Self { store, insight }
    }

    async fn allocate(
        &self,
        incident_id: &str,
        severity: SeverityLevel,
        estimated_duration: Option<i32>,
    ) -> Result<serde_json::Value> {
        let active = self
            .store
            .query_recent(
                &RecentFilter::default()
                    .active_only()
                    .since(Utc::now() - Duration::hours(LOAD_WINDOW_HOURS))
                    .limit(LOAD_QUERY_LIMIT),
            )
            .await?;
        let loads = stats::department_load(&active);

        let prompt = format!(
            "A {severity} incident (estimated duration: {} minutes) needs \
             resources. Current per-department load over the last {} hours: \
             {}. Respond as JSON with keys \"recommended_department\", \
             \"units\" and \"rationale\".",
            estimated_duration
                .map(|d| d.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            LOAD_WINDOW_HOURS,
            serde_json::to_string(&loads)?,
        );
        let plan = self.insight.generate(&prompt).await?;

        let allocation = json!({
            "incident_id": incident_id,
            "severity": severity,
            "estimated_duration": estimated_duration,
            "active_incidents": active.len(),
            "department_load": loads,
            "plan": plan,
            "generated_at": Utc::now(),
        });
        self.store
            .put_document("resource_allocations", incident_id, allocation)
            .await?;

        info!(
            incident_id,
            active_incidents = active.len(),
            "resource allocation stored"
        );
        Ok(json!({ "active_incidents": active.len() }))
    }
}

#[async_trait::async_trait]
impl TaskHandler for ResourceAllocationHandler {
    fn name(&self) -> &'static str {
        "resource_allocation_agent"
    }

    async fn handle(&self, task: &FanOutTask) -> Result<serde_json::Value> {
        match task {
            FanOutTask::ResourceAllocation {
                incident_id,
                severity,
                estimated_duration,
            } => {
                self.allocate(incident_id, *severity, *estimated_duration)
                    .await
            }
            other => bail!("resource allocation agent cannot handle {}", other.kind()),
        }
    }
}
