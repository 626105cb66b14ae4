//! In-memory RecordStore for deterministic tests: no network, no database.
//!
//! Failure injection mirrors the two shapes the pipeline must survive:
//! a transient outage (`fail_writes_times`) and a poison record that fails
//! every batch containing it (`fail_writes_for_id`).

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use anyhow::{bail, Result};
use chrono::Utc;

use citypulse_common::{ActivityRecord, EventStatus, Incident, TaskKind};

use crate::{live_doc, AreaStats, RecentFilter, RecordStore};

#[derive(Default)]
struct Inner {
    archive: HashMap<String, Incident>,
    rolling: HashMap<String, Incident>,
    documents: HashMap<(String, String), serde_json::Value>,
    area_stats: HashMap<String, AreaStats>,
    counted: HashSet<(String, String)>,
    activities: Vec<ActivityRecord>,
    write_failures_left: usize,
    poison_ids: HashSet<String>,
}

#[derive(Default)]
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` archive/rolling writes with a transient error.
    pub fn fail_writes_times(self, n: usize) -> Self {
        self.inner.lock().expect("store lock poisoned").write_failures_left = n;
        self
    }

    /// Permanently fail any write whose batch contains this incident id.
    pub fn fail_writes_for_id(self, id: &str) -> Self {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .poison_ids
            .insert(id.to_string());
        self
    }

    fn check_write(&self, incidents: &[Incident]) -> Result<()> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if inner.write_failures_left > 0 {
            inner.write_failures_left -= 1;
            bail!("record store temporarily unavailable");
        }
        if let Some(poisoned) = incidents.iter().find(|i| inner.poison_ids.contains(&i.id)) {
            bail!("write rejected for incident {}", poisoned.id);
        }
        Ok(())
    }

    fn merge(existing: Option<&Incident>, incoming: &Incident) -> Incident {
        let mut merged = incoming.clone();
        if merged.embedding.is_none() {
            merged.embedding = existing.and_then(|e| e.embedding.clone());
        }
        merged
    }

    // --- Assertion helpers ---

    pub fn archive_count(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").archive.len()
    }

    pub fn rolling_count(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").rolling.len()
    }

    pub fn archived(&self, id: &str) -> Option<Incident> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .archive
            .get(id)
            .cloned()
    }

    pub fn rolling(&self, id: &str) -> Option<Incident> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .rolling
            .get(id)
            .cloned()
    }

    pub fn document(&self, collection: &str, key: &str) -> Option<serde_json::Value> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .documents
            .get(&(collection.to_string(), key.to_string()))
            .cloned()
    }

    pub fn activities(&self) -> Vec<ActivityRecord> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .activities
            .clone()
    }

    pub fn activities_for(&self, task_type: TaskKind) -> Vec<ActivityRecord> {
        self.activities()
            .into_iter()
            .filter(|a| a.task_type == task_type)
            .collect()
    }

    /// Seed an incident directly (both tables), bypassing failure injection.
    pub fn seed(&self, incident: Incident) {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner
            .archive
            .insert(incident.id.clone(), incident.clone());
        inner.rolling.insert(incident.id.clone(), incident);
    }
}

#[async_trait::async_trait]
impl RecordStore for MemoryRecordStore {
    async fn processed_status(&self, incident_id: &str) -> Result<Option<EventStatus>> {
        Ok(self
            .inner
            .lock()
            .expect("store lock poisoned")
            .archive
            .get(incident_id)
            .map(|i| i.event_status))
    }

    async fn upsert_archive(&self, incident: &Incident) -> Result<()> {
        self.upsert_archive_batch(std::slice::from_ref(incident)).await
    }

    async fn upsert_rolling(&self, incident: &Incident) -> Result<()> {
        self.upsert_rolling_batch(std::slice::from_ref(incident)).await
    }

    async fn upsert_archive_batch(&self, incidents: &[Incident]) -> Result<()> {
        self.check_write(incidents)?;
        let mut inner = self.inner.lock().expect("store lock poisoned");
        for incident in incidents {
            let merged = Self::merge(inner.archive.get(&incident.id), incident);
            inner.archive.insert(incident.id.clone(), merged);
        }
        Ok(())
    }

    async fn upsert_rolling_batch(&self, incidents: &[Incident]) -> Result<()> {
        self.check_write(incidents)?;
        let mut inner = self.inner.lock().expect("store lock poisoned");
        for incident in incidents {
            let merged = Self::merge(inner.rolling.get(&incident.id), incident);
            inner.rolling.insert(incident.id.clone(), merged);
        }
        Ok(())
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
        let mut inner = self.inner.lock().expect("store lock poisoned");
        let key = (incident_id.to_string(), area.to_string());
        if !inner.counted.insert(key) {
            return Ok(false);
        }
        let stats = inner
            .area_stats
            .entry(area.to_string())
            .or_insert_with(|| AreaStats {
                area: area.to_string(),
                incident_count: 0,
                priority_sum: 0.0,
                last_incident: None,
            });
        stats.incident_count += 1;
        stats.priority_sum += priority_delta;
        stats.last_incident = Some(Utc::now());
        Ok(true)
    }

    async fn area_stats(&self, area: &str) -> Result<Option<AreaStats>> {
        Ok(self
            .inner
            .lock()
            .expect("store lock poisoned")
            .area_stats
            .get(area)
            .cloned())
    }

    async fn append_activity(&self, record: &ActivityRecord) -> Result<()> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .activities
            .push(record.clone());
        Ok(())
    }

    async fn query_recent(&self, filter: &RecentFilter) -> Result<Vec<Incident>> {
        let inner = self.inner.lock().expect("store lock poisoned");
        let mut matches: Vec<Incident> = inner
            .rolling
            .values()
            .filter(|i| {
                filter
                    .incident_id
                    .as_ref()
                    .is_none_or(|id| &i.id == id)
                    && filter
                        .event_type
                        .as_ref()
                        .is_none_or(|t| &i.event_type == t)
                    && filter
                        .area_category
                        .as_ref()
                        .is_none_or(|a| &i.area_category == a)
                    && filter
                        .department
                        .as_ref()
                        .is_none_or(|d| &i.assigned_department == d)
                    && filter.since.is_none_or(|s| i.timestamp >= s)
                    && filter.until.is_none_or(|u| i.timestamp < u)
                    && (!filter.active_only || i.is_active())
                    && filter
                        .near
                        .is_none_or(|n| n.contains(i.latitude, i.longitude))
            })
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matches.truncate(filter.limit.max(0) as usize);
        Ok(matches)
    }

    async fn put_document(
        &self,
        collection: &str,
        key: &str,
        doc: serde_json::Value,
    ) -> Result<()> {
        self.inner
            .lock()
            .expect("store lock poisoned")
            .documents
            .insert((collection.to_string(), key.to_string()), doc);
        Ok(())
    }
}
