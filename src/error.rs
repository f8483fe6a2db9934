//! Error types for Catchup.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("AI completion error: {0}")]
    Ai(#[from] AiError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Persistence-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Connection error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// AI completion service errors.
///
/// The three upstream classes (`RateLimited`, `QuotaExhausted`,
/// `RequestFailed`) are distinguished because callers treat them
/// differently for retry; `InvalidResponse` covers output that came back
/// but could not be decoded.
#[derive(Debug, thiserror::Error)]
pub enum AiError {
    #[error("Upstream rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Upstream quota or billing exhausted")]
    QuotaExhausted,

    #[error("Completion request failed: {reason}")]
    RequestFailed { reason: String },

    #[error("Invalid completion response: {reason}")]
    InvalidResponse { reason: String },
}

impl AiError {
    /// Whether a retry with backoff has any chance of succeeding.
    ///
    /// Quota exhaustion requires human intervention, and a response that
    /// decoded badly will decode badly again at temperature 0.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AiError::RateLimited { .. } | AiError::RequestFailed { .. }
        )
    }
}

/// Triage pipeline errors — the fatal ones that abort a run.
///
/// Per-message enrichment failures and clustering failures never surface
/// here; they degrade to fallback values inside their stages.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Missing or invalid caller identity")]
    Unauthorized,

    #[error("Failed to fetch unread messages: {0}")]
    Fetch(String),

    #[error("Plan synthesis failed: {0}")]
    Synthesis(#[source] AiError),
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
