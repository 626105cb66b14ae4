//! Postgres-backed RecordStore.
//!
//! Every query binds its parameters — analytic filters go through
//! `QueryBuilder::push_bind`, never string interpolation.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};

use citypulse_common::{
    ActivityRecord, EventStatus, Incident, SeverityLevel,
};

use crate::{live_doc, AreaStats, RecentFilter, RecordStore};

const INCIDENT_COLUMNS: &str = "id, event_type, sub_category, description, keywords, language, \
    latitude, longitude, location_name, area_category, ward_number, pincode, \
    event_ts, stream_ts, estimated_duration, actual_duration, peak_hours, \
    severity_level, priority_score, impact_radius_km, source, verified, \
    reporter_id, verification_count, media_type, media_url, event_status, \
    resolution_notes, weather_condition, traffic_density, assigned_department, embedding";

/// `ON CONFLICT` update clause. The stored embedding is kept when the
/// incoming record has none, so a status update can never strip enrichment.
const UPSERT_SET: &str = "event_type = EXCLUDED.event_type, \
    sub_category = EXCLUDED.sub_category, description = EXCLUDED.description, \
    keywords = EXCLUDED.keywords, language = EXCLUDED.language, \
    latitude = EXCLUDED.latitude, longitude = EXCLUDED.longitude, \
    location_name = EXCLUDED.location_name, area_category = EXCLUDED.area_category, \
    ward_number = EXCLUDED.ward_number, pincode = EXCLUDED.pincode, \
    event_ts = EXCLUDED.event_ts, stream_ts = EXCLUDED.stream_ts, \
    estimated_duration = EXCLUDED.estimated_duration, \
    actual_duration = EXCLUDED.actual_duration, peak_hours = EXCLUDED.peak_hours, \
    severity_level = EXCLUDED.severity_level, priority_score = EXCLUDED.priority_score, \
    impact_radius_km = EXCLUDED.impact_radius_km, source = EXCLUDED.source, \
    verified = EXCLUDED.verified, reporter_id = EXCLUDED.reporter_id, \
    verification_count = EXCLUDED.verification_count, media_type = EXCLUDED.media_type, \
    media_url = EXCLUDED.media_url, event_status = EXCLUDED.event_status, \
    resolution_notes = EXCLUDED.resolution_notes, \
    weather_condition = EXCLUDED.weather_condition, \
    traffic_density = EXCLUDED.traffic_density, \
    assigned_department = EXCLUDED.assigned_department, \
    embedding = COALESCE(EXCLUDED.embedding, t.embedding)";

#[derive(Clone, Copy)]
enum Table {
    Archive,
    Rolling,
}

impl Table {
    fn name(&self) -> &'static str {
        match self {
            Table::Archive => "citypulse_archive",
            Table::Rolling => "citypulse_rolling",
        }
    }
}

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn upsert_into(&self, table: Table, incidents: &[Incident]) -> Result<()> {
        if incidents.is_empty() {
            return Ok(());
        }

        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "INSERT INTO {} AS t ({INCIDENT_COLUMNS}) ",
            table.name()
        ));
        qb.push_values(incidents, |mut b, incident| {
            b.push_bind(&incident.id)
                .push_bind(&incident.event_type)
                .push_bind(&incident.sub_category)
                .push_bind(&incident.description)
                .push_bind(&incident.keywords)
                .push_bind(&incident.language)
                .push_bind(incident.latitude)
                .push_bind(incident.longitude)
                .push_bind(&incident.location_name)
                .push_bind(&incident.area_category)
                .push_bind(incident.ward_number)
                .push_bind(&incident.pincode)
                .push_bind(incident.timestamp)
                .push_bind(incident.stream_timestamp)
                .push_bind(incident.estimated_duration)
                .push_bind(incident.actual_duration)
                .push_bind(incident.peak_hours)
                .push_bind(incident.severity_level.as_str())
                .push_bind(incident.priority_score)
                .push_bind(incident.impact_radius_km)
                .push_bind(&incident.source)
                .push_bind(incident.verified)
                .push_bind(&incident.reporter_id)
                .push_bind(incident.verification_count)
                .push_bind(&incident.media_type)
                .push_bind(&incident.media_url)
                .push_bind(incident.event_status.as_str())
                .push_bind(&incident.resolution_notes)
                .push_bind(&incident.weather_condition)
                .push_bind(&incident.traffic_density)
                .push_bind(&incident.assigned_department)
                .push_bind(&incident.embedding);
        });
        qb.push(format!(" ON CONFLICT (id) DO UPDATE SET {UPSERT_SET}"));

        qb.build().execute(&self.pool).await?;
        Ok(())
    }
}

fn incident_from_row(row: &PgRow) -> Result<Incident> {
    let severity_raw: String = row.try_get("severity_level")?;
    let status_raw: String = row.try_get("event_status")?;

    Ok(Incident {
        id: row.try_get("id")?,
        event_type: row.try_get("event_type")?,
        sub_category: row.try_get("sub_category")?,
        description: row.try_get("description")?,
        keywords: row.try_get("keywords")?,
        language: row.try_get("language")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
        location_name: row.try_get("location_name")?,
        area_category: row.try_get("area_category")?,
        ward_number: row.try_get("ward_number")?,
        pincode: row.try_get("pincode")?,
        timestamp: row.try_get("event_ts")?,
        stream_timestamp: row.try_get("stream_ts")?,
        estimated_duration: row.try_get("estimated_duration")?,
        actual_duration: row.try_get("actual_duration")?,
        peak_hours: row.try_get("peak_hours")?,
        severity_level: SeverityLevel::parse(&severity_raw)
            .ok_or_else(|| anyhow!("unknown severity_level: {severity_raw}"))?,
        priority_score: row.try_get("priority_score")?,
        impact_radius_km: row.try_get("impact_radius_km")?,
        source: row.try_get("source")?,
        verified: row.try_get("verified")?,
        reporter_id: row.try_get("reporter_id")?,
        verification_count: row.try_get("verification_count")?,
        media_type: row.try_get("media_type")?,
        media_url: row.try_get("media_url")?,
        event_status: EventStatus::parse(&status_raw)
            .ok_or_else(|| anyhow!("unknown event_status: {status_raw}"))?,
        resolution_notes: row.try_get("resolution_notes")?,
        weather_condition: row.try_get("weather_condition")?,
        traffic_density: row.try_get("traffic_density")?,
        assigned_department: row.try_get("assigned_department")?,
        embedding: row.try_get("embedding")?,
    })
}

#[async_trait::async_trait]
impl RecordStore for PgRecordStore {
    async fn processed_status(&self, incident_id: &str) -> Result<Option<EventStatus>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT event_status FROM citypulse_archive WHERE id = $1")
                .bind(incident_id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((raw,)) => Ok(Some(
                EventStatus::parse(&raw).ok_or_else(|| anyhow!("unknown event_status: {raw}"))?,
            )),
            None => Ok(None),
        }
    }

    async fn upsert_archive(&self, incident: &Incident) -> Result<()> {
        self.upsert_into(Table::Archive, std::slice::from_ref(incident))
            .await
    }

    async fn upsert_rolling(&self, incident: &Incident) -> Result<()> {
        self.upsert_into(Table::Rolling, std::slice::from_ref(incident))
            .await
    }

    async fn upsert_archive_batch(&self, incidents: &[Incident]) -> Result<()> {
        self.upsert_into(Table::Archive, incidents).await
    }

    async fn upsert_rolling_batch(&self, incidents: &[Incident]) -> Result<()> {
        self.upsert_into(Table::Rolling, incidents).await
    }

    async fn upsert_live_doc(&self, incident: &Incident) -> Result<()> {
        self.put_document("incidents", &incident.id, live_doc(incident)?)
            .await
    }

    async fn increment_area_stats(
        &self,
        incident_id: &str,
        area: &str,
        priority_delta: f64,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO citypulse_area_seen (incident_id, area) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(incident_id)
        .bind(area)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO citypulse_area_stats (area, incident_count, priority_sum, last_incident) \
             VALUES ($1, 1, $2, now()) \
             ON CONFLICT (area) DO UPDATE SET \
                 incident_count = citypulse_area_stats.incident_count + 1, \
                 priority_sum = citypulse_area_stats.priority_sum + EXCLUDED.priority_sum, \
                 last_incident = now()",
        )
        .bind(area)
        .bind(priority_delta)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn area_stats(&self, area: &str) -> Result<Option<AreaStats>> {
        let row: Option<(String, i64, f64, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT area, incident_count, priority_sum, last_incident \
             FROM citypulse_area_stats WHERE area = $1",
        )
        .bind(area)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(area, incident_count, priority_sum, last_incident)| AreaStats {
            area,
            incident_count,
            priority_sum,
            last_incident,
        }))
    }

    async fn append_activity(&self, record: &ActivityRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO citypulse_activities \
             (agent_name, task_type, status, detail, ts, incident_id) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&record.agent_name)
        .bind(record.task_type.as_str())
        .bind(record.status.as_str())
        .bind(&record.detail)
        .bind(record.timestamp)
        .bind(&record.incident_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query_recent(&self, filter: &RecentFilter) -> Result<Vec<Incident>> {
        let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(format!(
            "SELECT {INCIDENT_COLUMNS} FROM citypulse_rolling WHERE TRUE"
        ));

        if let Some(id) = &filter.incident_id {
            qb.push(" AND id = ").push_bind(id);
        }
        if let Some(event_type) = &filter.event_type {
            qb.push(" AND event_type = ").push_bind(event_type);
        }
        if let Some(area) = &filter.area_category {
            qb.push(" AND area_category = ").push_bind(area);
        }
        if let Some(department) = &filter.department {
            qb.push(" AND assigned_department = ").push_bind(department);
        }
        if let Some(since) = filter.since {
            qb.push(" AND event_ts >= ").push_bind(since);
        }
        if let Some(until) = filter.until {
            qb.push(" AND event_ts < ").push_bind(until);
        }
        if filter.active_only {
            qb.push(" AND event_status IN ('reported', 'verified', 'in_progress')");
        }
        if let Some(near) = filter.near {
            let (min_lat, max_lat, min_lng, max_lng) = near.bounding_box();
            qb.push(" AND latitude BETWEEN ")
                .push_bind(min_lat)
                .push(" AND ")
                .push_bind(max_lat);
            qb.push(" AND longitude BETWEEN ")
                .push_bind(min_lng)
                .push(" AND ")
                .push_bind(max_lng);
        }

        qb.push(" ORDER BY event_ts DESC LIMIT ").push_bind(filter.limit);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(incident_from_row).collect()
    }

    async fn put_document(
        &self,
        collection: &str,
        key: &str,
        doc: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO citypulse_live_docs (collection, key, doc, updated_at) \
             VALUES ($1, $2, $3, now()) \
             ON CONFLICT (collection, key) DO UPDATE SET \
                 doc = EXCLUDED.doc, updated_at = now()",
        )
        .bind(collection)
        .bind(key)
        .bind(&doc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
