use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CityPulseError;

// --- Enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SeverityLevel::Low => "low",
            SeverityLevel::Medium => "medium",
            SeverityLevel::High => "high",
            SeverityLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(SeverityLevel::Low),
            "medium" => Some(SeverityLevel::Medium),
            "high" => Some(SeverityLevel::High),
            "critical" => Some(SeverityLevel::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for SeverityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Reported,
    Verified,
    InProgress,
    Resolved,
    FalseAlarm,
}

impl EventStatus {
    /// Terminal statuses are never re-enriched or re-fanned-out.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Resolved | EventStatus::FalseAlarm)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Reported => "reported",
            EventStatus::Verified => "verified",
            EventStatus::InProgress => "in_progress",
            EventStatus::Resolved => "resolved",
            EventStatus::FalseAlarm => "false_alarm",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reported" => Some(EventStatus::Reported),
            "verified" => Some(EventStatus::Verified),
            "in_progress" => Some(EventStatus::InProgress),
            "resolved" => Some(EventStatus::Resolved),
            "false_alarm" => Some(EventStatus::FalseAlarm),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Incident ---

/// A single reported real-world event. The central entity of the pipeline.
///
/// `timestamp` is when the incident occurred; `stream_timestamp` is when the
/// pipeline first observed it. Both are persisted so staleness and SLA
/// windows can be computed downstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub event_type: String,
    pub sub_category: String,
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default = "default_language")]
    pub language: String,

    pub latitude: f64,
    pub longitude: f64,
    pub location_name: String,
    pub area_category: String,
    pub ward_number: i32,
    pub pincode: String,

    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub stream_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_duration: Option<i32>,
    #[serde(default)]
    pub actual_duration: Option<i32>,
    #[serde(default)]
    pub peak_hours: bool,

    pub severity_level: SeverityLevel,
    pub priority_score: f64,
    #[serde(default = "default_impact_radius")]
    pub impact_radius_km: f64,

    pub source: String,
    #[serde(default)]
    pub verified: bool,
    #[serde(default)]
    pub reporter_id: Option<String>,
    #[serde(default)]
    pub verification_count: i32,
    #[serde(default)]
    pub media_type: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,

    #[serde(default = "default_status")]
    pub event_status: EventStatus,
    #[serde(default)]
    pub resolution_notes: Option<String>,
    #[serde(default)]
    pub weather_condition: Option<String>,
    #[serde(default)]
    pub traffic_density: Option<String>,

    pub assigned_department: String,

    /// Attached once at enrichment time, never mutated afterward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_impact_radius() -> f64 {
    1.0
}

fn default_status() -> EventStatus {
    EventStatus::Reported
}

impl Incident {
    /// Parse a raw bus payload into an Incident.
    ///
    /// Malformed payloads are a permanent failure — retrying cannot fix a
    /// parse error. Upstream producers are inconsistent about the priority
    /// scale (some emit 0–1, some 0–10), so scores ≤ 1.0 are normalized to
    /// the 0–10 scale here, at the ingestion boundary.
    pub fn parse(payload: &serde_json::Value) -> Result<Self, CityPulseError> {
        let mut incident: Incident = serde_json::from_value(payload.clone())
            .map_err(|e| CityPulseError::PermanentInput(e.to_string()))?;

        if incident.id.is_empty() {
            return Err(CityPulseError::PermanentInput(
                "incident id must not be empty".to_string(),
            ));
        }
        if incident.priority_score <= 1.0 {
            incident.priority_score *= 10.0;
        }
        if !(0.0..=10.0).contains(&incident.priority_score) {
            return Err(CityPulseError::PermanentInput(format!(
                "priority_score {} outside 0–10 bound",
                incident.priority_score
            )));
        }
        if incident.stream_timestamp.is_none() {
            incident.stream_timestamp = Some(Utc::now());
        }

        Ok(incident)
    }

    /// Text fed to the embedding model: description plus keywords.
    pub fn embedding_input(&self) -> String {
        if self.keywords.is_empty() {
            self.description.clone()
        } else {
            format!("{} {}", self.description, self.keywords.join(" "))
        }
    }

    /// Whether the incident should appear on live dashboards.
    pub fn is_active(&self) -> bool {
        matches!(
            self.event_status,
            EventStatus::Reported | EventStatus::Verified | EventStatus::InProgress
        )
    }
}

// --- FanOutTask ---

/// Stable task-kind keys for the dispatcher registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    NotificationBlast,
    DepartmentAlert,
    TrendAnalysis,
    ResourceAllocation,
    DailySummary,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::NotificationBlast => "notification_blast",
            TaskKind::DepartmentAlert => "department_alert",
            TaskKind::TrendAnalysis => "trend_analysis",
            TaskKind::ResourceAllocation => "resource_allocation",
            TaskKind::DailySummary => "daily_summary",
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One downstream action produced by routing an enriched incident.
///
/// Ephemeral: lives on the bus between publish and ack, never persisted
/// as a first-class entity. Only its effects (activity rows, notification
/// documents) survive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", rename_all = "snake_case")]
pub enum FanOutTask {
    NotificationBlast {
        incident_id: String,
        departments: Vec<String>,
        radius_km: f64,
    },
    DepartmentAlert {
        incident_id: String,
        department: String,
    },
    TrendAnalysis {
        incident_id: String,
        event_type: String,
        location: Option<String>,
    },
    ResourceAllocation {
        incident_id: String,
        severity: SeverityLevel,
        estimated_duration: Option<i32>,
    },
    DailySummary {
        date: NaiveDate,
    },
}

impl FanOutTask {
    pub fn kind(&self) -> TaskKind {
        match self {
            FanOutTask::NotificationBlast { .. } => TaskKind::NotificationBlast,
            FanOutTask::DepartmentAlert { .. } => TaskKind::DepartmentAlert,
            FanOutTask::TrendAnalysis { .. } => TaskKind::TrendAnalysis,
            FanOutTask::ResourceAllocation { .. } => TaskKind::ResourceAllocation,
            FanOutTask::DailySummary { .. } => TaskKind::DailySummary,
        }
    }

    /// The incident this task references, if any.
    pub fn incident_id(&self) -> Option<&str> {
        match self {
            FanOutTask::NotificationBlast { incident_id, .. }
            | FanOutTask::DepartmentAlert { incident_id, .. }
            | FanOutTask::TrendAnalysis { incident_id, .. }
            | FanOutTask::ResourceAllocation { incident_id, .. } => Some(incident_id),
            FanOutTask::DailySummary { .. } => None,
        }
    }
}

// --- ActivityRecord ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Success,
    Failure,
}

impl ActivityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityStatus::Success => "success",
            ActivityStatus::Failure => "failure",
        }
    }
}

/// Append-only audit entry written once per handled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub agent_name: String,
    pub task_type: TaskKind,
    pub status: ActivityStatus,
    pub detail: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub incident_id: Option<String>,
}

// --- AnalyticsEvent ---

/// Dashboard metric published to the analytics stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub timestamp: DateTime<Utc>,
    pub metric_name: String,
    pub metric_value: f64,
    pub dimensions: BTreeMap<String, String>,
}

impl AnalyticsEvent {
    pub fn new(metric_name: &str, metric_value: f64) -> Self {
        Self {
            timestamp: Utc::now(),
            metric_name: metric_name.to_string(),
            metric_value,
            dimensions: BTreeMap::new(),
        }
    }

    pub fn dimension(mut self, key: &str, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.to_string(), value.into());
        self
    }
}

// --- Notification ---

/// High-priority notification payload for the notification stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub kind: String,
    pub incident_id: String,
    pub title: String,
    pub message: String,
    pub priority_score: f64,
    pub location: String,
    pub departments: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Build the standard high-priority notification for an incident.
    /// The message is the description truncated to 200 characters.
    pub fn high_priority(incident: &Incident) -> Self {
        Self {
            kind: "high_priority_incident".to_string(),
            incident_id: incident.id.clone(),
            title: format!(
                "High Priority: {} in {}",
                incident.event_type, incident.area_category
            ),
            message: truncate_chars(&incident.description, 200),
            priority_score: incident.priority_score,
            location: incident.location_name.clone(),
            departments: vec![incident.assigned_department.clone()],
            timestamp: Utc::now(),
        }
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
