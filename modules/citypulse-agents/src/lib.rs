//! Intelligent agent workers: consume fan-out tasks from the bus, do a
//! bounded amount of work (analytic reads, one opaque insight call), and
//! leave exactly one activity record per invocation.

use anyhow::Result;

use citypulse_common::FanOutTask;

pub mod dispatcher;
pub mod handlers;
pub mod stats;

pub use dispatcher::AgentDispatcher;

/// One downstream consumer of fan-out tasks.
///
/// Handlers must be idempotent: the at-least-once bus means any task can
/// fire twice, and duplicate completion (a repeated notification, a
/// re-stored plan) is an accepted, logged cost.
#[async_trait::async_trait]
pub trait TaskHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle one task. The returned value becomes the activity record's
    /// detail payload.
    async fn handle(&self, task: &FanOutTask) -> Result<serde_json::Value>;
}
