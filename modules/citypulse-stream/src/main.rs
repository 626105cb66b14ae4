use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use citypulse_agents::{dispatcher::AgentDispatcher, handlers::default_registry};
use citypulse_ai::{Embedder, InsightClient};
use citypulse_bus::{topics, EventBus, MemoryBus};
use citypulse_common::Config;
use citypulse_store::{migrate::migrate, PgRecordStore, RecordStore};
use citypulse_stream::{
    bulk::{BulkConfig, BulkLoader},
    IncidentIngestPipeline, PriorityFanOutRouter, RouterConfig,
};

#[derive(Parser)]
#[command(name = "citypulse", about = "Real-time city incident pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the streaming pipeline and agent dispatcher.
    Run,
    /// Load a JSON dump of historical incidents, then exit.
    LoadHistorical {
        /// Path to a JSON array of raw incident payloads.
        file: PathBuf,
        /// Override the configured batch size.
        #[arg(long)]
        batch_size: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("citypulse=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_redacted();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    migrate(&pool).await?;

    let store: Arc<dyn RecordStore> = Arc::new(PgRecordStore::new(pool));
    let embedder = Arc::new(Embedder::new(
        &config.embedding_api_key,
        &config.embedding_base_url,
        &config.embedding_model,
        Duration::from_secs(config.embedding_timeout_secs),
    )?);

    match cli.command {
        Command::Run => run(config, store, embedder).await,
        Command::LoadHistorical { file, batch_size } => {
            load_historical(config, store, embedder, file, batch_size).await
        }
    }
}

async fn run(config: Config, store: Arc<dyn RecordStore>, embedder: Arc<Embedder>) -> Result<()> {
    info!("CityPulse pipeline starting...");

    let bus = Arc::new(MemoryBus::new());
    let insight = Arc::new(InsightClient::new(
        &config.insight_api_key,
        &config.insight_base_url,
        &config.insight_model,
    ));

    let pipeline = IncidentIngestPipeline::new(
        embedder,
        store.clone(),
        bus.clone(),
        PriorityFanOutRouter::new(RouterConfig::from_config(&config)),
        config.notify_threshold,
    );
    let incident_sub = bus
        .subscribe(topics::INCIDENT_STREAM, config.incident_max_in_flight)
        .await?;
    let pipeline_task = tokio::spawn(async move { pipeline.run(incident_sub).await });

    let dispatcher = AgentDispatcher::new(
        default_registry(store.clone(), bus.clone(), insight),
        store,
        Duration::from_secs(config.task_timeout_secs),
    );
    let task_sub = bus
        .subscribe(topics::AGENT_TASKS, config.agent_max_in_flight)
        .await?;
    let dispatcher_task = tokio::spawn(async move { dispatcher.run(task_sub).await });

    // Notification and analytics consumers are external in production;
    // here they are logged so the streams never back up.
    let notification_drain = spawn_drain(bus.clone(), topics::NOTIFICATION_STREAM);
    let analytics_drain = spawn_drain(bus.clone(), topics::ANALYTICS_STREAM);

    info!("pipeline and dispatcher running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    pipeline_task.abort();
    dispatcher_task.abort();
    notification_drain.abort();
    analytics_drain.abort();
    Ok(())
}

fn spawn_drain(bus: Arc<MemoryBus>, topic: &'static str) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sub = match bus.subscribe(topic, 64).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(topic, error = %e, "drain subscription failed");
                return;
            }
        };
        while let Some(delivery) = sub.recv().await {
            info!(topic, payload = %delivery.payload, "stream message");
            delivery.ack();
        }
    })
}

async fn load_historical(
    config: Config,
    store: Arc<dyn RecordStore>,
    embedder: Arc<Embedder>,
    file: PathBuf,
    batch_size: Option<usize>,
) -> Result<()> {
    let raw = tokio::fs::read_to_string(&file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let events: Vec<serde_json::Value> =
        serde_json::from_str(&raw).context("dump must be a JSON array of incident objects")?;

    let loader = BulkLoader::new(
        embedder,
        store,
        BulkConfig {
            batch_size: batch_size.unwrap_or(config.bulk_batch_size),
            live_window_days: config.live_window_days,
        },
    );
    let report = loader.load(&events).await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.failed_ids.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} of {} events failed to load", report.failed_ids.len(), report.total)
    }
}
