//! Priority-banded fan-out routing.
//!
//! Purely a function of the enriched incident and the configured
//! thresholds. No I/O here; the pipeline publishes whatever this returns.

use citypulse_common::{Config, FanOutTask, Incident};

/// Band boundaries. Each band is closed at its lower threshold and open
/// above, so a score exactly at `high_threshold` routes high.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub high_threshold: f64,
    pub medium_threshold: f64,
    pub emergency_recipient: String,
}

impl RouterConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            high_threshold: config.high_threshold,
            medium_threshold: config.medium_threshold,
            emergency_recipient: config.emergency_recipient.clone(),
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            high_threshold: 8.0,
            medium_threshold: 6.0,
            emergency_recipient: "emergency_services".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PriorityFanOutRouter {
    config: RouterConfig,
}

impl PriorityFanOutRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Tasks to enqueue for this incident. Deterministic: the same
    /// incident always yields the same tasks in the same order.
    pub fn route(&self, incident: &Incident) -> Vec<FanOutTask> {
        let score = incident.priority_score;

        if score >= self.config.high_threshold {
            let mut departments = vec![incident.assigned_department.clone()];
            if incident.assigned_department != self.config.emergency_recipient {
                departments.push(self.config.emergency_recipient.clone());
            }
            vec![
                FanOutTask::NotificationBlast {
                    incident_id: incident.id.clone(),
                    departments,
                    radius_km: incident.impact_radius_km,
                },
                FanOutTask::TrendAnalysis {
                    incident_id: incident.id.clone(),
                    event_type: incident.event_type.clone(),
                    location: Some(incident.area_category.clone()),
                },
                FanOutTask::ResourceAllocation {
                    incident_id: incident.id.clone(),
                    severity: incident.severity_level,
                    estimated_duration: incident.estimated_duration,
                },
            ]
        } else if score >= self.config.medium_threshold {
            vec![
                FanOutTask::DepartmentAlert {
                    incident_id: incident.id.clone(),
                    department: incident.assigned_department.clone(),
                },
                FanOutTask::ResourceAllocation {
                    incident_id: incident.id.clone(),
                    severity: incident.severity_level,
                    estimated_duration: incident.estimated_duration,
                },
            ]
        } else {
            // Low band still tracks resourcing so dashboards see the load.
            vec![FanOutTask::ResourceAllocation {
                incident_id: incident.id.clone(),
                severity: incident.severity_level,
                estimated_duration: incident.estimated_duration,
            }]
        }
    }
}
