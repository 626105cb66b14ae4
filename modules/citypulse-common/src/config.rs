use std::env;

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,

    // Embedding provider (OpenAI-compatible endpoint)
    pub embedding_api_key: String,
    pub embedding_base_url: String,
    pub embedding_model: String,
    pub embedding_timeout_secs: u64,

    // Insight provider (opaque generative capability)
    pub insight_api_key: String,
    pub insight_base_url: String,
    pub insight_model: String,

    // Routing thresholds (0–10 priority scale)
    pub high_threshold: f64,
    pub medium_threshold: f64,
    pub notify_threshold: f64,
    pub emergency_recipient: String,

    // Flow control
    pub incident_max_in_flight: usize,
    pub agent_max_in_flight: usize,
    pub task_timeout_secs: u64,

    // Bulk loading
    pub bulk_batch_size: usize,
    pub live_window_days: i64,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            embedding_api_key: required_env("EMBEDDING_API_KEY"),
            embedding_base_url: env_or("EMBEDDING_BASE_URL", "https://api.voyageai.com/v1"),
            embedding_model: env_or("EMBEDDING_MODEL", "voyage-3-large"),
            embedding_timeout_secs: env_or_parse("EMBEDDING_TIMEOUT_SECS", 30),
            insight_api_key: required_env("INSIGHT_API_KEY"),
            insight_base_url: env_or("INSIGHT_BASE_URL", "https://api.openai.com/v1"),
            insight_model: env_or("INSIGHT_MODEL", "gpt-4o-mini"),
            high_threshold: env_or_parse("HIGH_PRIORITY_THRESHOLD", 8.0),
            medium_threshold: env_or_parse("MEDIUM_PRIORITY_THRESHOLD", 6.0),
            notify_threshold: env_or_parse("NOTIFY_THRESHOLD", 7.0),
            emergency_recipient: env_or("EMERGENCY_RECIPIENT", "emergency_services"),
            incident_max_in_flight: env_or_parse("INCIDENT_MAX_IN_FLIGHT", 100),
            agent_max_in_flight: env_or_parse("AGENT_MAX_IN_FLIGHT", 50),
            task_timeout_secs: env_or_parse("TASK_TIMEOUT_SECS", 10),
            bulk_batch_size: env_or_parse("BULK_BATCH_SIZE", 100),
            live_window_days: env_or_parse("LIVE_WINDOW_DAYS", 7),
        }
    }

    /// Log the config with secrets redacted.
    pub fn log_redacted(&self) {
        tracing::info!(
            embedding_base_url = %self.embedding_base_url,
            embedding_model = %self.embedding_model,
            insight_model = %self.insight_model,
            high_threshold = self.high_threshold,
            medium_threshold = self.medium_threshold,
            incident_max_in_flight = self.incident_max_in_flight,
            agent_max_in_flight = self.agent_max_in_flight,
            bulk_batch_size = self.bulk_batch_size,
            "Config loaded"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{key} must parse as a {}", std::any::type_name::<T>())),
        Err(_) => default,
    }
}
