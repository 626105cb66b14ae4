//! Historical backfill: batched embedding and persistence with the same
//! keying and counter rules as the live pipeline, so loading a file and
//! streaming the same events converge on identical state.

use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use citypulse_ai::TextEmbedder;
use citypulse_common::Incident;
use citypulse_store::RecordStore;

#[derive(Debug, Clone)]
pub struct BulkConfig {
    /// Events per embedding/persistence batch.
    pub batch_size: usize,
    /// Events newer than this feed live dashboards and area counters.
    pub live_window_days: i64,
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            live_window_days: 7,
        }
    }
}

/// Outcome of one load. `failed_ids` lists every event that did not make
/// it into the archive, after one retry per batch.
#[derive(Debug, Clone, Serialize)]
pub struct BulkReport {
    pub total: usize,
    pub loaded: usize,
    pub failed_ids: Vec<String>,
}

pub struct BulkLoader {
    embedder: Arc<dyn TextEmbedder>,
    store: Arc<dyn RecordStore>,
    config: BulkConfig,
}

impl BulkLoader {
    pub fn new(
        embedder: Arc<dyn TextEmbedder>,
        store: Arc<dyn RecordStore>,
        config: BulkConfig,
    ) -> Self {
        Self {
            embedder,
            store,
            config,
        }
    }

    /// Load a dump of raw incident payloads. A failing batch is retried
    /// once, then skipped; the loader always runs to the end of the input.
    pub async fn load(&self, raw_events: &[serde_json::Value]) -> BulkReport {
        let total = raw_events.len();
        let mut loaded = 0usize;
        let mut failed_ids = Vec::new();

        for chunk in raw_events.chunks(self.config.batch_size.max(1)) {
            let mut incidents = Vec::with_capacity(chunk.len());
            for payload in chunk {
                match Incident::parse(payload) {
                    Ok(incident) => incidents.push(incident),
                    Err(e) => {
                        let id = payload
                            .get("id")
                            .and_then(|v| v.as_str())
                            .unwrap_or("<missing id>")
                            .to_string();
                        warn!(incident_id = %id, error = %e, "skipping malformed event");
                        failed_ids.push(id);
                    }
                }
            }
            if incidents.is_empty() {
                continue;
            }

            match self.load_batch(&mut incidents).await {
                Ok(()) => loaded += incidents.len(),
                Err(e) => {
                    warn!(error = %e, batch = incidents.len(), "batch failed, retrying once");
                    match self.load_batch(&mut incidents).await {
                        Ok(()) => loaded += incidents.len(),
                        Err(e) => {
                            warn!(error = %e, batch = incidents.len(), "batch failed twice, skipping");
                            failed_ids.extend(incidents.iter().map(|i| i.id.clone()));
                            continue;
                        }
                    }
                }
            }

            self.refresh_live_state(&incidents).await;
        }

        info!(total, loaded, failed = failed_ids.len(), "bulk load finished");
        BulkReport {
            total,
            loaded,
            failed_ids,
        }
    }

    async fn load_batch(&self, incidents: &mut [Incident]) -> Result<()> {
        let texts: Vec<String> = incidents.iter().map(Incident::embedding_input).collect();
        let embeddings = self.embedder.embed_batch(texts).await?;
        for (incident, embedding) in incidents.iter_mut().zip(embeddings) {
            incident.embedding = Some(embedding);
        }

        self.store.upsert_archive_batch(incidents).await?;
        self.store.upsert_rolling_batch(incidents).await?;
        Ok(())
    }

    /// Live documents and area counters, only for events recent enough to
    /// matter on a dashboard. Counter dedup makes a re-run of the same
    /// dump harmless.
    async fn refresh_live_state(&self, incidents: &[Incident]) {
        let cutoff = Utc::now() - Duration::days(self.config.live_window_days);
        for incident in incidents.iter().filter(|i| i.timestamp >= cutoff) {
            if let Err(e) = self.store.upsert_live_doc(incident).await {
                warn!(incident_id = %incident.id, error = %e, "live doc update failed");
            }
            if let Err(e) = self
                .store
                .increment_area_stats(
                    &incident.id,
                    &incident.area_category,
                    incident.priority_score,
                )
                .await
            {
                warn!(incident_id = %incident.id, error = %e, "area counter update failed");
            }
        }
    }
}
