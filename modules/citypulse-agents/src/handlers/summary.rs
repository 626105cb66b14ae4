//! End-of-day city summary over one calendar day of incidents.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{Duration, NaiveDate, NaiveTime, Utc};
use serde_json::json;
use tracing::info;

use citypulse_ai::InsightModel;
use citypulse_common::FanOutTask;
use citypulse_store::{RecentFilter, RecordStore};

use crate::{stats, TaskHandler};

const SUMMARY_QUERY_LIMIT: i64 = 1000;

pub struct DailySummaryHandler {
    store: Arc<dyn RecordStore>,
    insight: Arc<dyn InsightModel>,
}

impl DailySummaryHandler {
    pub fn new(store: Arc<dyn RecordStore>, insight: Arc<dyn InsightModel>) -> Self {
        Self { store, insight }
    }

    async fn summarize(&self, date: NaiveDate) -> Result<serde_json::Value> {
        let day_start = date.and_time(NaiveTime::MIN).and_utc();
        let day_end = day_start + Duration::days(1);

        let incidents = self
            .store
            .query_recent(
                &RecentFilter::default()
                    .since(day_start)
                    .until(day_end)
                    .limit(SUMMARY_QUERY_LIMIT),
            )
            .await?;
        let rollup = stats::daily_rollup(&incidents);

        let prompt = format!(
            "Write a brief daily operations summary for the city for {date}. \
             Respond as JSON with keys \"summary\" and \"highlights\" (a \
             list). Incident groups: {}",
            serde_json::to_string(&rollup)?,
        );
        let narrative = self.insight.generate(&prompt).await?;

        let document = json!({
            "date": date,
            "total_incidents": incidents.len(),
            "groups": rollup,
            "narrative": narrative,
            "generated_at": Utc::now(),
        });
        self.store
            .put_document("daily_summaries", &date.to_string(), document)
            .await?;

        info!(%date, total = incidents.len(), "daily summary stored");
        Ok(json!({ "date": date, "total_incidents": incidents.len() }))
    }
}

#[async_trait::async_trait]
impl TaskHandler for DailySummaryHandler {
    fn name(&self) -> &'static str {
        "daily_summary_agent"
    }

    async fn handle(&self, task: &FanOutTask) -> Result<serde_json::Value> {
        match task {
            FanOutTask::DailySummary { date } => self.summarize(*date).await,
            other => bail!("daily summary agent cannot handle {}", other.kind()),
        }
    }
}
