//! Stakeholder notifications for high and medium priority incidents.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::info;

use citypulse_ai::InsightModel;
use citypulse_bus::{topics, EventBus};
use citypulse_common::FanOutTask;
use citypulse_store::{GeoRadius, RecentFilter, RecordStore};

use crate::TaskHandler;

/// Handles both the wide blast (all relevant departments plus an
/// LLM-drafted citizen advisory) and the targeted single-department alert.
pub struct NotificationHandler {
    store: Arc<dyn RecordStore>,
    bus: Arc<dyn EventBus>,
    insight: Arc<dyn InsightModel>,
}

impl NotificationHandler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        bus: Arc<dyn EventBus>,
        insight: Arc<dyn InsightModel>,
    ) -> Self {
        Self { store, bus, insight }
    }

    async fn load_incident(&self, incident_id: &str) -> Result<citypulse_common::Incident> {
        self.store
            .query_recent(&RecentFilter::by_id(incident_id))
            .await?
            .into_iter()
            .next()
            .with_context(|| format!("incident {incident_id} not found"))
    }

    async fn blast(
        &self,
        incident_id: &str,
        departments: &[String],
        radius_km: f64,
    ) -> Result<serde_json::Value> {
        let incident = self.load_incident(incident_id).await?;

        // Recent activity in the blast radius gives the advisory context
        // beyond the triggering incident itself.
        let nearby = self
            .store
            .query_recent(
                &RecentFilter::default()
                    .near(GeoRadius {
                        lat: incident.latitude,
                        lng: incident.longitude,
                        radius_km,
                    })
                    .since(Utc::now() - Duration::days(30))
                    .limit(50),
            )
            .await?;

        let prompt = format!(
            "You are a city incident communications assistant. Draft a short \
             public advisory (2-3 sentences) for this incident. Respond as \
             JSON with keys \"headline\" and \"advisory\".\n\n\
             Incident: {} ({}) at {}, {}.\n\
             Severity: {}, priority {:.1}.\n\
             Description: {}\n\
             Recent incidents within {:.1} km in the last 30 days: {}",
            incident.event_type,
            incident.sub_category,
            incident.location_name,
            incident.area_category,
            incident.severity_level,
            incident.priority_score,
            incident.description,
            radius_km,
            nearby.len(),
        );
        let advisory = self.insight.generate(&prompt).await?;

        let notification = json!({
            "kind": "notification_blast",
            "incident_id": incident.id,
            "event_type": incident.event_type,
            "location": incident.location_name,
            "area_category": incident.area_category,
            "priority_score": incident.priority_score,
            "departments": departments,
            "radius_km": radius_km,
            "advisory": advisory,
            "nearby_incident_count": nearby.len(),
            "timestamp": Utc::now(),
        });

        let message_id = self
            .bus
            .publish(topics::NOTIFICATION_STREAM, notification.clone())
            .await?;
        self.store
            .put_document("notifications", &incident.id, notification)
            .await?;

        info!(
            incident_id = %incident.id,
            departments = departments.len(),
            "notification blast published"
        );
        Ok(json!({
            "message_id": message_id,
            "departments": departments,
            "nearby_incident_count": nearby.len(),
        }))
    }

    async fn department_alert(
        &self,
        incident_id: &str,
        department: &str,
    ) -> Result<serde_json::Value> {
        let incident = self.load_incident(incident_id).await?;

        // Targeted operational alert: no generative step, just the facts.
        let alert = json!({
            "kind": "department_alert",
            "incident_id": incident.id,
            "department": department,
            "event_type": incident.event_type,
            "severity_level": incident.severity_level,
            "priority_score": incident.priority_score,
            "location": incident.location_name,
            "area_category": incident.area_category,
            "ward_number": incident.ward_number,
            "description": incident.description,
            "timestamp": Utc::now(),
        });

        let message_id = self
            .bus
            .publish(topics::NOTIFICATION_STREAM, alert)
            .await?;

        info!(incident_id = %incident.id, department, "department alert published");
        Ok(json!({ "message_id": message_id, "department": department }))
    }
}

#[async_trait::async_trait]
impl TaskHandler for NotificationHandler {
    fn name(&self) -> &'static str {
        "notification_agent"
    }

    async fn handle(&self, task: &FanOutTask) -> Result<serde_json::Value> {
        match task {
            FanOutTask::NotificationBlast {
                incident_id,
                departments,
                radius_km,
            } => self.blast(incident_id, departments, *radius_km).await,
            FanOutTask::DepartmentAlert {
                incident_id,
                department,
            } => self.department_alert(incident_id, department).await,
            other => bail!("notification agent cannot handle {}", other.kind()),
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

    fn incident(id: &str) -> Incident {
        Incident {
            id: id.to_string(),
            event_type: "flooding".to_string(),
            sub_category: "waterlogging".to_string(),
            description: "Roads submerged near the market".to_string(),
            keywords: vec!["flood".to_string()],
            language: "en".to_string(),
            latitude: 12.97,
            longitude: 77.59,
            location_name: "KR Market".to_string(),
            area_category: "Central".to_string(),
            ward_number: 110,
            pincode: "560002".to_string(),
            timestamp: Utc::now(),
            stream_timestamp: None,
            estimated_duration: None,
            actual_duration: None,
            peak_hours: false,
            severity_level: SeverityLevel::Critical,
            priority_score: 8.5,
            impact_radius_km: 2.0,
            source: "citizen_report".to_string(),
            verified: true,
            reporter_id: None,
            verification_count: 3,
            media_type: None,
            media_url: None,
            event_status: EventStatus::Verified,
            resolution_notes: None,
            weather_condition: None,
            traffic_density: None,
            assigned_department: "BBMP".to_string(),
            embedding: None,
        }
    }

    #[tokio::test]
    async fn blast_publishes_and_stores_notification() {
        let store = Arc::new(MemoryRecordStore::new());
        store.seed(incident("X1"));
        let bus = Arc::new(MemoryBus::new());
        let insight = Arc::new(MockInsight::with_response(
            serde_json::json!({"headline": "Flooding at KR Market", "advisory": "Avoid the area."}),
        ));

        let handler = NotificationHandler::new(store.clone(), bus.clone(), insight.clone());
        let task = FanOutTask::NotificationBlast {
            incident_id: "X1".to_string(),
            departments: vec!["BBMP".to_string(), "emergency_services".to_string()],
            radius_km: 2.0,
        };

        let detail = handler.handle(&task).await.unwrap();
        assert_eq!(detail["departments"].as_array().unwrap().len(), 2);

        let doc = store.document("notifications", "X1").unwrap();
        assert_eq!(doc["kind"], "notification_blast");
        assert_eq!(doc["advisory"]["headline"], "Flooding at KR Market");

        let mut sub = bus
            .subscribe(topics::NOTIFICATION_STREAM, 10)
            .await
            .unwrap();
        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.payload["incident_id"], "X1");
        delivery.ack();

        // The prompt carried the incident context to the model.
        assert!(insight.prompts()[0].contains("KR Market"));
    }

    #[tokio::test]
    async fn department_alert_skips_the_model() {
        let store = Arc::new(MemoryRecordStore::new());
        store.seed(incident("X2"));
        let bus = Arc::new(MemoryBus::new());
        let insight = Arc::new(MockInsight::new());

        let handler = NotificationHandler::new(store, bus.clone(), insight.clone());
        let task = FanOutTask::DepartmentAlert {
            incident_id: "X2".to_string(),
            department: "BWSSB".to_string(),
        };
        handler.handle(&task).await.unwrap();

        assert!(insight.prompts().is_empty());

        let mut sub = bus
            .subscribe(topics::NOTIFICATION_STREAM, 10)
            .await
            .unwrap();
        let delivery = sub.recv().await.unwrap();
        assert_eq!(delivery.payload["kind"], "department_alert");
        assert_eq!(delivery.payload["department"], "BWSSB");
        delivery.ack();
    }

    #[tokio::test]
    async fn missing_incident_is_an_error() {
        let store = Arc::new(MemoryRecordStore::new());
        let bus = Arc::new(MemoryBus::new());
        let handler = NotificationHandler::new(store, bus, Arc::new(MockInsight::new()));

        let task = FanOutTask::DepartmentAlert {
            incident_id: "nope".to_string(),
            department: "BBMP".to_string(),
        };
        assert!(handler.handle(&task).await.is_err());
    }
}
