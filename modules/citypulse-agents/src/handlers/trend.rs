//! Trend analysis over the last 30 days of a given event type.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;

use citypulse_ai::InsightModel;
use citypulse_bus::{topics, EventBus};
use citypulse_common::{AnalyticsEvent, FanOutTask};
use citypulse_store::{RecentFilter, RecordStore};

use crate::{stats, TaskHandler};

const TREND_WINDOW_DAYS: i64 = 30;
const TREND_QUERY_LIMIT: i64 = 500;

pub struct TrendAnalysisHandler {
    store: Arc<dyn RecordStore>,
    bus: Arc<dyn EventBus>,
    insight: Arc<dyn InsightModel>,
}

impl TrendAnalysisHandler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        bus: Arc<dyn EventBus>,
        insight: Arc<dyn InsightModel>,
    ) -> Self {
        Self { store, bus, insight }
    }

    async fn analyze(
        &self,
        incident_id: &str,
        event_type: &str,
        location: Option<&str>,
    ) -> Result<serde_json::Value> {
        let mut filter = RecentFilter::default()
            .event_type(event_type)
            .since(Utc::now() - Duration::days(TREND_WINDOW_DAYS))
            .limit(TREND_QUERY_LIMIT);
        if let Some(area) = location {
            filter.area_category = Some(area.to_string());
        }

        let incidents = self.store.query_recent(&filter).await?;
        let trend = stats::trend_stats(&incidents);

        let prompt = format!(
            "Analyze this city incident trend data and respond as JSON with \
             keys \"summary\" and \"recommendations\" (a list).\n\n\
             Event type: {}\nWindow: last {} days\nStatistics: {}",
            event_type,
            TREND_WINDOW_DAYS,
            serde_json::to_string(&trend)?,
        );
        let analysis = self.insight.generate(&prompt).await?;

        let report = json!({
            "incident_id": incident_id,
            "event_type": event_type,
            "location": location,
            "window_days": TREND_WINDOW_DAYS,
            "stats": trend,
            "analysis": analysis,
            "generated_at": Utc::now(),
        });
        self.store
            .put_document("trend_analysis", incident_id, report)
            .await?;

        let event = AnalyticsEvent::new("trend_analysis_completed", trend.total_incidents as f64)
            .dimension("event_type", event_type)
            .dimension("incident_id", incident_id);
        self.bus
            .publish(topics::ANALYTICS_STREAM, serde_json::to_value(&event)?)
            .await?;

        info!(
            incident_id,
            event_type,
            incidents = trend.total_incidents,
            "trend analysis stored"
        );
        Ok(json!({
            "total_incidents": trend.total_incidents,
            "affected_areas": trend.affected_areas,
        }))
    }
}

#[async_trait::async_trait]
impl TaskHandler for TrendAnalysisHandler {
    fn name(&self) -> &'static str {
        "trend_analysis_agent"
    }

    async fn handle(&self, task: &FanOutTask) -> Result<serde_json::Value> {
        match task {
            FanOutTask::TrendAnalysis {
                incident_id,
                event_type,
                location,
            } => {
                self.analyze(incident_id, event_type, location.as_deref())
                    .await
            }
            other => bail!("trend analysis agent cannot handle {}", other.kind()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use citypulse_ai::testing::MockInsight;
    use citypulse_bus::{MemoryBus, Subscription};
    use citypulse_common::{EventStatus, Incident, SeverityLevel};
    use citypulse_store::testing::MemoryRecordStore;

    fn incident(id: &str, event_type: &str, priority: f64) -> Incident {
        Incident {
            id: id.to_string(),
            event_type: event_type.to_string(),
            sub_category: "general".to_string(),
            description: "test".to_string(),
            keywords: vec![],
            language: "en".to_string(),
            latitude: 12.97,
            longitude: 77.59,
            location_name: "somewhere".to_string(),
            area_category: "Central".to_string(),
            ward_number: 100,
            pincode: "560001".to_string(),
            timestamp: Utc::now() - Duration::days(2),
            stream_timestamp: None,
            estimated_duration: None,
            actual_duration: None,
            peak_hours: false,
            severity_level: SeverityLevel::Medium,
            priority_score: priority,
            impact_radius_km: 1.0,
            source: "test".to_string(),
            verified: false,
            reporter_id: None,
            verification_count: 0,
            media_type: None,
            media_url: None,
            event_status: EventStatus::Reported,
            resolution_notes: None,
            weather_condition: None,
            traffic_density: None,
            assigned_department: "BBMP".to_string(),
            embedding: None,
        }
    }

    #[tokio::test]
    async fn stores_report_and_emits_analytics_event() {
        let store = Arc::new(MemoryRecordStore::new());
        store.seed(incident("a", "flooding", 7.0));
        store.seed(incident("b", "flooding", 5.0));
        store.seed(incident("c", "power_outage", 4.0));
        let bus = Arc::new(MemoryBus::new());
        let insight = Arc::new(MockInsight::with_response(
            serde_json::json!({"summary": "rising", "recommendations": []}),
        ));

        let handler = TrendAnalysisHandler::new(store.clone(), bus.clone(), insight);
        let task = FanOutTask::TrendAnalysis {
            incident_id: "a".to_string(),
            event_type: "flooding".to_string(),
            location: None,
        };
        let detail = handler.handle(&task).await.unwrap();

        // Only the two flooding incidents count.
        assert_eq!(detail["total_incidents"], 2);

        let report = store.document("trend_analysis", "a").unwrap();
        assert_eq!(report["stats"]["total_incidents"], 2);
        assert_eq!(report["analysis"]["summary"], "rising");

        let mut sub = bus.subscribe(topics::ANALYTICS_STREAM, 10).await.unwrap();
        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.payload["metric_name"], "trend_analysis_completed");
        assert_eq!(delivery.payload["metric_value"], 2.0);
        delivery.ack();
    }
}
