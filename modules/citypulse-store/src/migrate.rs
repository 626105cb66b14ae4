//! Schema setup. Statements are idempotent and run at startup.

use anyhow::Result;
use sqlx::PgPool;
use tracing::info;

const INCIDENT_COLUMNS: &str = r#"
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    sub_category TEXT NOT NULL,
    description TEXT NOT NULL,
    keywords TEXT[] NOT NULL DEFAULT '{}',
    language TEXT NOT NULL DEFAULT 'en',
    latitude DOUBLE PRECISION NOT NULL,
    longitude DOUBLE PRECISION NOT NULL,
    location_name TEXT NOT NULL,
    area_category TEXT NOT NULL,
    ward_number INTEGER NOT NULL,
    pincode TEXT NOT NULL,
    event_ts TIMESTAMPTZ NOT NULL,
    stream_ts TIMESTAMPTZ,
    estimated_duration INTEGER,
    actual_duration INTEGER,
    peak_hours BOOLEAN NOT NULL DEFAULT FALSE,
    severity_level TEXT NOT NULL,
    priority_score DOUBLE PRECISION NOT NULL,
    impact_radius_km DOUBLE PRECISION NOT NULL DEFAULT 1.0,
    source TEXT NOT NULL,
    verified BOOLEAN NOT NULL DEFAULT FALSE,
    reporter_id TEXT,
    verification_count INTEGER NOT NULL DEFAULT 0,
    media_type TEXT,
    media_url TEXT,
    event_status TEXT NOT NULL DEFAULT 'reported',
    resolution_notes TEXT,
    weather_condition TEXT,
    traffic_density TEXT,
    assigned_department TEXT NOT NULL,
    embedding REAL[]
"#;

pub async fn migrate(pool: &PgPool) -> Result<()> {
    let statements = [
        format!("CREATE TABLE IF NOT EXISTS citypulse_archive ({INCIDENT_COLUMNS})"),
        format!("CREATE TABLE IF NOT EXISTS citypulse_rolling ({INCIDENT_COLUMNS})"),
        "CREATE INDEX IF NOT EXISTS idx_rolling_event_ts ON citypulse_rolling (event_ts DESC)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_rolling_event_type ON citypulse_rolling (event_type)"
            .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_rolling_status ON citypulse_rolling (event_status)"
            .to_string(),
        r#"CREATE TABLE IF NOT EXISTS citypulse_live_docs (
            collection TEXT NOT NULL,
            key TEXT NOT NULL,
            doc JSONB NOT NULL,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            PRIMARY KEY (collection, key)
        )"#
        .to_string(),
        r#"CREATE TABLE IF NOT EXISTS citypulse_area_stats (
            area TEXT PRIMARY KEY,
            incident_count BIGINT NOT NULL DEFAULT 0,
            priority_sum DOUBLE PRECISION NOT NULL DEFAULT 0,
            last_incident TIMESTAMPTZ
        )"#
        .to_string(),
        r#"CREATE TABLE IF NOT EXISTS citypulse_area_seen (
            incident_id TEXT NOT NULL,
            area TEXT NOT NULL,
            PRIMARY KEY (incident_id, area)
        )"#
        .to_string(),
        r#"CREATE TABLE IF NOT EXISTS citypulse_activities (
            id BIGSERIAL PRIMARY KEY,
            agent_name TEXT NOT NULL,
            task_type TEXT NOT NULL,
            status TEXT NOT NULL,
            detail JSONB NOT NULL,
            ts TIMESTAMPTZ NOT NULL,
            incident_id TEXT
        )"#
        .to_string(),
        "CREATE INDEX IF NOT EXISTS idx_activities_incident ON citypulse_activities (incident_id)"
            .to_string(),
    ];

    for statement in &statements {
        sqlx::query(statement).execute(pool).await?;
    }

    info!("migrations complete");
    Ok(())
}
