//! Real-time incident ingestion: consume raw reports from the incident
//! stream, enrich with embeddings, persist to the analytic and live stores,
//! and fan out downstream work by priority.

pub mod bulk;
pub mod pipeline;
pub mod router;

pub use bulk::{BulkLoader, BulkReport};
pub use pipeline::IncidentIngestPipeline;
pub use router::{PriorityFanOutRouter, RouterConfig};
