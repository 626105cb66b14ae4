//! Pure aggregate computations over query results.
//!
//! The original analytic SQL (GROUP BY rollups) becomes in-process folds
//! over a bounded, parameterized `query_recent` read. Keeps the store
//! interface narrow and the math unit-testable.

use std::collections::HashMap;

use chrono::Timelike;
use serde::Serialize;

use citypulse_common::{Incident, SeverityLevel};

#[derive(Debug, Clone, Serialize)]
pub struct Hotspot {
    pub area_category: String,
    pub ward_number: i32,
    pub incident_count: usize,
    pub avg_priority: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HourCount {
    pub hour: u32,
    pub incident_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendStats {
    pub total_incidents: usize,
    pub avg_priority: f64,
    pub affected_areas: usize,
    pub hotspots: Vec<Hotspot>,
    pub peak_hours: Vec<HourCount>,
}

/// Trend rollup for one event type: totals, top-10 hotspots by
/// (area, ward), top-5 hours of day by incident count.
pub fn trend_stats(incidents: &[Incident]) -> TrendStats {
    let total = incidents.len();
    let avg_priority = mean(incidents.iter().map(|i| i.priority_score));

    let mut areas: HashMap<&str, ()> = HashMap::new();
    let mut by_spot: HashMap<(&str, i32), (usize, f64)> = HashMap::new();
    let mut by_hour: HashMap<u32, usize> = HashMap::new();

    for incident in incidents {
        areas.insert(&incident.area_category, ());
        let spot = by_spot
            .entry((&incident.area_category, incident.ward_number))
            .or_insert((0, 0.0));
        spot.0 += 1;
        spot.1 += incident.priority_score;
        *by_hour.entry(incident.timestamp.hour()).or_insert(0) += 1;
    }

    let mut hotspots: Vec<Hotspot> = by_spot
        .into_iter()
        .map(|((area, ward), (count, priority_total))| Hotspot {
            area_category: area.to_string(),
            ward_number: ward,
            incident_count: count,
            avg_priority: priority_total / count as f64,
        })
        .collect();
    hotspots.sort_by(|a, b| {
        b.incident_count
            .cmp(&a.incident_count)
            .then_with(|| a.area_category.cmp(&b.area_category))
    });
    hotspots.truncate(10);

    let mut peak_hours: Vec<HourCount> = by_hour
        .into_iter()
        .map(|(hour, incident_count)| HourCount {
            hour,
            incident_count,
        })
        .collect();
    peak_hours.sort_by(|a, b| {
        b.incident_count
            .cmp(&a.incident_count)
            .then_with(|| a.hour.cmp(&b.hour))
    });
    peak_hours.truncate(5);

    TrendStats {
        total_incidents: total,
        avg_priority,
        affected_areas: areas.len(),
        hotspots,
        peak_hours,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DepartmentLoad {
    pub department: String,
    pub active_incidents: usize,
    pub avg_priority: f64,
    pub high_severity_count: usize,
}

/// Per-department workload over active incidents, busiest first.
pub fn department_load(incidents: &[Incident]) -> Vec<DepartmentLoad> {
    let mut by_department: HashMap<&str, (usize, f64, usize)> = HashMap::new();

    for incident in incidents {
        let entry = by_department
            .entry(&incident.assigned_department)
            .or_insert((0, 0.0, 0));
        entry.0 += 1;
        entry.1 += incident.priority_score;
        if incident.severity_level >= SeverityLevel::High {
            entry.2 += 1;
        }
    }

    let mut loads: Vec<DepartmentLoad> = by_department
        .into_iter()
        .map(|(department, (count, priority_total, high))| DepartmentLoad {
            department: department.to_string(),
            active_incidents: count,
            avg_priority: priority_total / count as f64,
            high_severity_count: high,
        })
        .collect();
    loads.sort_by(|a, b| {
        b.active_incidents
            .cmp(&a.active_incidents)
            .then_with(|| a.department.cmp(&b.department))
    });
    loads
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyRollup {
    pub event_type: String,
    pub severity_level: SeverityLevel,
    pub area_category: String,
    pub assigned_department: String,
    pub incident_count: usize,
    pub avg_priority: f64,
}

/// One day of incidents grouped the way the daily summary prompt needs.
pub fn daily_rollup(incidents: &[Incident]) -> Vec<DailyRollup> {
    let mut groups: HashMap<(&str, SeverityLevel, &str, &str), (usize, f64)> = HashMap::new();

    for incident in incidents {
        let key = (
            incident.event_type.as_str(),
            incident.severity_level,
            incident.area_category.as_str(),
            incident.assigned_department.as_str(),
        );
        let entry = groups.entry(key).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += incident.priority_score;
    }

    let mut rollups: Vec<DailyRollup> = groups
        .into_iter()
        .map(
            |((event_type, severity, area, department), (count, priority_total))| DailyRollup {
                event_type: event_type.to_string(),
                severity_level: severity,
                area_category: area.to_string(),
                assigned_department: department.to_string(),
                incident_count: count,
                avg_priority: priority_total / count as f64,
            },
        )
        .collect();
    rollups.sort_by(|a, b| {
        b.incident_count
            .cmp(&a.incident_count)
            .then_with(|| a.event_type.cmp(&b.event_type))
    });
    rollups
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f64
    }
}
