//! Durable record storage behind one trait.
//!
//! Two analytic projections (an append-only archive and a rolling real-time
//! table) plus a fast document store for live UI state and per-area
//! counters. All upserts are keyed by incident id and idempotent, which is
//! what makes at-least-once redelivery safe upstream.

use anyhow::Result;
use chrono::{DateTime, Utc};

use citypulse_common::{ActivityRecord, EventStatus, Incident};

pub mod migrate;
pub mod pg;

pub use pg::PgRecordStore;

#[cfg(feature = "test-utils")]
pub mod testing;

// --- Query filters ---

/// Geographic radius filter, applied as a degree bounding box.
#[derive(Debug, Clone, Copy)]
pub struct GeoRadius {
    pub lat: f64,
    pub lng: f64,
    pub radius_km: f64,
}

impl GeoRadius {
    /// Bounding box as (min_lat, max_lat, min_lng, max_lng).
    pub fn bounding_box(&self) -> (f64, f64, f64, f64) {
        const KM_PER_DEGREE_LAT: f64 = 111.0;
        let lat_delta = self.radius_km / KM_PER_DEGREE_LAT;
        let lng_scale = self.lat.to_radians().cos().abs().max(0.01);
        let lng_delta = self.radius_km / (KM_PER_DEGREE_LAT * lng_scale);
        (
            self.lat - lat_delta,
            self.lat + lat_delta,
            self.lng - lng_delta,
            self.lng + lng_delta,
        )
    }

    pub fn contains(&self, lat: f64, lng: f64) -> bool {
        let (min_lat, max_lat, min_lng, max_lng) = self.bounding_box();
        (min_lat..=max_lat).contains(&lat) && (min_lng..=max_lng).contains(&lng)
    }
}

/// Typed filter criteria for `query_recent`. Every field becomes a bound
/// parameter — never string-interpolated SQL.
#[derive(Debug, Clone)]
pub struct RecentFilter {
    pub incident_id: Option<String>,
    pub event_type: Option<String>,
    pub area_category: Option<String>,
    pub department: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Only non-terminal incidents (reported/verified/in_progress).
    pub active_only: bool,
    pub near: Option<GeoRadius>,
    pub limit: i64,
}

impl Default for RecentFilter {
    fn default() -> Self {
        Self {
            incident_id: None,
            event_type: None,
            area_category: None,
            department: None,
            since: None,
            until: None,
            active_only: false,
            near: None,
            limit: 100,
        }
    }
}

impl RecentFilter {
    pub fn by_id(id: &str) -> Self {
        Self {
            incident_id: Some(id.to_string()),
            limit: 1,
            ..Self::default()
        }
    }

    pub fn event_type(mut self, event_type: &str) -> Self {
        self.event_type = Some(event_type.to_string());
        self
    }

    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: DateTime<Utc>) -> Self {
        self.until = Some(until);
        self
    }

    pub fn active_only(mut self) -> Self {
        self.active_only = true;
        self
    }

    pub fn near(mut self, near: GeoRadius) -> Self {
        self.near = Some(near);
        self
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }
}

/// Per-area live counters for dashboards.
#[derive(Debug, Clone, PartialEq)]
pub struct AreaStats {
    pub area: String,
    pub incident_count: i64,
    pub priority_sum: f64,
    pub last_incident: Option<DateTime<Utc>>,
}

// --- RecordStore ---

#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Status of an incident that has already been through enrichment and
    /// persistence, or `None` if this id was never fully processed.
    async fn processed_status(&self, incident_id: &str) -> Result<Option<EventStatus>>;

    /// Upsert into the append-only embeddings archive. Keyed by id; a
    /// missing embedding on the incoming record never clobbers a stored one.
    async fn upsert_archive(&self, incident: &Incident) -> Result<()>;

    /// Upsert into the rolling real-time table. Same keying rules.
    async fn upsert_rolling(&self, incident: &Incident) -> Result<()>;

    /// Bulk variants: one persistence call per batch.
    async fn upsert_archive_batch(&self, incidents: &[Incident]) -> Result<()>;
    async fn upsert_rolling_batch(&self, incidents: &[Incident]) -> Result<()>;

    /// Upsert the live UI document for an incident.
    async fn upsert_live_doc(&self, incident: &Incident) -> Result<()>;

    /// Atomically bump the per-area incident count and priority sum.
    /// Keyed by (incident id, area): returns `false` when this pair was
    /// already counted, so duplicate delivery never double-counts.
    async fn increment_area_stats(
        &self,
        incident_id: &str,
        area: &str,
        priority_delta: f64,
    ) -> Result<bool>;

    async fn area_stats(&self, area: &str) -> Result<Option<AreaStats>>;

    /// Append-only audit log. Never mutated or deleted.
    async fn append_activity(&self, record: &ActivityRecord) -> Result<()>;

    /// Read-only analytic query over the rolling table.
    async fn query_recent(&self, filter: &RecentFilter) -> Result<Vec<Incident>>;

    /// Upsert an arbitrary document into the fast store (notifications,
    /// trend analyses, allocation plans, daily summaries).
    async fn put_document(
        &self,
        collection: &str,
        key: &str,
        doc: serde_json::Value,
    ) -> Result<()>;
}

/// Live UI document for an incident: the record plus a derived ui_status.
pub fn live_doc(incident: &Incident) -> Result<serde_json::Value> {
    let mut doc = serde_json::to_value(incident)?;
    let ui_status = if incident.is_active() { "active" } else { "resolved" };
    doc["ui_status"] = serde_json::Value::String(ui_status.to_string());
    doc["last_updated"] = serde_json::to_value(Utc::now())?;
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_widens_longitude_away_from_equator() {
        let equator = GeoRadius {
            lat: 0.0,
            lng: 77.0,
            radius_km: 111.0,
        };
        let (min_lat, max_lat, min_lng, max_lng) = equator.bounding_box();
        assert!((max_lat - min_lat - 2.0).abs() < 0.01);
        assert!((max_lng - min_lng - 2.0).abs() < 0.01);

        let northern = GeoRadius {
            lat: 60.0,
            lng: 77.0,
            radius_km: 111.0,
        };
        let (_, _, n_min_lng, n_max_lng) = northern.bounding_box();
        assert!(n_max_lng - n_min_lng > max_lng - min_lng);
    }

    #[test]
    fn geo_radius_contains() {
        let zone = GeoRadius {
            lat: 12.97,
            lng: 77.59,
            radius_km: 5.0,
        };
        assert!(zone.contains(12.97, 77.59));
        assert!(!zone.contains(13.5, 77.59));
    }
}
