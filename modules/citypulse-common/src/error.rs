use thiserror::Error;

/// Failure taxonomy for the ingestion pipeline and agent dispatcher.
///
/// Duplicate delivery is deliberately not a variant — it is an expected
/// outcome of at-least-once delivery and short-circuits to a no-op ack.
#[derive(Error, Debug)]
pub enum CityPulseError {
    /// Malformed input. Ack and drop — retrying cannot fix a parse error.
    #[error("Permanent input error: {0}")]
    PermanentInput(String),

    /// Remote call failed transiently. Nack and let the bus redeliver.
    #[error("Transient remote error: {0}")]
    TransientRemote(String),

    /// Handler exceeded its deadline. Redelivered like a transient error,
    /// but logged distinctly: the remote side may still complete, so
    /// side effects can double-fire.
    #[error("Handler timeout after {elapsed_ms}ms in {task_kind}")]
    HandlerTimeout { task_kind: String, elapsed_ms: u64 },

    /// Task payload names a kind this dispatcher does not know. Nacked,
    /// not dropped — a newer dispatcher instance may understand it.
    #[error("Unknown task kind: {0}")]
    UnknownTaskKind(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl CityPulseError {
    /// Whether redelivery can plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CityPulseError::TransientRemote(_)
                | CityPulseError::HandlerTimeout { .. }
                | CityPulseError::Database(_)
        )
    }
}
