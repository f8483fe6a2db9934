//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Configuration for the AI completion client.
///
/// Built explicitly and passed to the client at construction so tests can
/// substitute a fake client instead of reading process-wide environment.
#[derive(Debug, Clone)]
pub struct AiConfig {
    /// API key for the completion backend.
    pub api_key: SecretString,
    /// Model identifier.
    pub model: String,
    /// Base URL of the completion API.
    pub base_url: String,
    /// Deadline applied to each outbound completion call.
    pub request_timeout: Duration,
    /// Maximum attempts per completion call (1 = no retry).
    pub max_attempts: u32,
    /// Base backoff between retries, doubled per attempt with jitter.
    pub backoff_base_ms: u64,
}

impl AiConfig {
    /// Create a config with production defaults for the given key and model.
    pub fn new(api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            api_key,
            model: model.into(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            request_timeout: Duration::from_secs(30),
            max_attempts: 3,
            backoff_base_ms: 500,
        }
    }

    /// Build from environment variables (used by the binary, not the library).
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".to_string()))?;
        let model = std::env::var("CATCHUP_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());

        let mut config = Self::new(SecretString::from(api_key), model);
        if let Ok(url) = std::env::var("CATCHUP_AI_BASE_URL") {
            config.base_url = url;
        }
        if let Ok(secs) = std::env::var("CATCHUP_AI_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| ConfigError::InvalidValue {
                key: "CATCHUP_AI_TIMEOUT_SECS".to_string(),
                message: "expected an integer number of seconds".to_string(),
            })?;
            config.request_timeout = Duration::from_secs(secs);
        }
        Ok(config)
    }
}

/// Triage pipeline configuration.
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// Maximum unread messages ingested per run.
    pub fetch_limit: usize,
    /// Concurrent enrichment workers (bounds outbound AI calls).
    pub enrich_workers: usize,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            fetch_limit: 50,
            enrich_workers: 5,
        }
    }
}
