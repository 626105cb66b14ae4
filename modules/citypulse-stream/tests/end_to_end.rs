//! Full-path test: raw payload in on the incident stream, enriched records
//! and agent activity out, with duplicate delivery along the way.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use citypulse_agents::{dispatcher::AgentDispatcher, handlers::default_registry};
use citypulse_ai::testing::{FixedEmbedder, MockInsight};
use citypulse_bus::{topics, EventBus, MemoryBus};
use citypulse_store::testing::MemoryRecordStore;
use citypulse_store::RecordStore;
use citypulse_stream::{IncidentIngestPipeline, PriorityFanOutRouter, RouterConfig};

fn raw_incident(id: &str, priority: f64) -> serde_json::Value {
    json!({
        "id": id,
        "event_type": "flooding",
        "sub_category": "waterlogging",
        "description": "Roads submerged near the market after heavy rain",
        "keywords": ["flood", "market"],
        "latitude": 12.97,
        "longitude": 77.59,
        "location_name": "KR Market",
        "area_category": "Central",
        "ward_number": 110,
        "pincode": "560002",
        "timestamp": Utc::now(),
        "severity_level": "critical",
        "priority_score": priority,
        "source": "citizen_report",
        "assigned_department": "BBMP",
    })
}

#[tokio::test]
async fn duplicate_delivery_processes_once_end_to_end() {
    let store = Arc::new(MemoryRecordStore::new());
    let bus = Arc::new(MemoryBus::new());
    let insight = Arc::new(MockInsight::with_response(
        json!({"summary": "ok", "advisory": "stay away", "recommendations": []}),
    ));

    let pipeline = IncidentIngestPipeline::new(
        Arc::new(FixedEmbedder::new(8)),
        store.clone(),
        bus.clone(),
        PriorityFanOutRouter::new(RouterConfig::default()),
        7.0,
    );
    let dispatcher = AgentDispatcher::new(
        default_registry(store.clone(), bus.clone(), insight),
        store.clone(),
        Duration::from_secs(5),
    );

    // The same incident arrives twice, as at-least-once transports allow.
    bus.publish(topics::INCIDENT_STREAM, raw_incident("X1", 8.5))
        .await
        .unwrap();
    bus.publish(topics::INCIDENT_STREAM, raw_incident("X1", 8.5))
        .await
        .unwrap();

    let mut incidents = bus.subscribe(topics::INCIDENT_STREAM, 10).await.unwrap();
    for _ in 0..2 {
        let delivery = incidents.recv().await.unwrap();
        pipeline.handle_delivery(delivery).await;
    }

    assert_eq!(store.archive_count(), 1);
    assert!(store.archived("X1").unwrap().embedding.is_some());

    // High band fans out exactly three tasks, once.
    let mut tasks = bus.subscribe(topics::AGENT_TASKS, 10).await.unwrap();
    for _ in 0..3 {
        let delivery = tokio::time::timeout(Duration::from_secs(1), tasks.recv())
            .await
            .expect("expected a fan-out task")
            .expect("bus closed");
        dispatcher.handle_delivery(delivery).await;
    }
    assert!(
        tokio::time::timeout(Duration::from_millis(100), tasks.recv())
            .await
            .is_err(),
        "duplicate delivery must not fan out again"
    );

    // One activity per task, not per delivery.
    let activities = store.activities();
    assert_eq!(activities.len(), 3);
    assert!(activities
        .iter()
        .all(|a| a.incident_id.as_deref() == Some("X1")));

    // The blast handler stored its advisory document.
    assert!(store.document("notifications", "X1").is_some());
    assert!(store.document("trend_analysis", "X1").is_some());
    assert!(store.document("resource_allocations", "X1").is_some());

    let stats = store.area_stats("Central").await.unwrap().unwrap();
    assert_eq!(stats.incident_count, 1);
}
