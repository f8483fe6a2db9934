//! Anthropic Messages API client.
//!
//! Distinguishes the three upstream failure classes (rate limited, quota
//! exhausted, generic) from HTTP status and body, and retries retryable
//! failures with jittered exponential backoff. Timeouts surface as generic
//! request failures and share their handling.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use super::{CompletionClient, CompletionRequest, CompletionResponse};
use crate::config::AiConfig;
use crate::error::AiError;

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Maximum error-body characters carried into an error reason.
const ERROR_BODY_PREVIEW: usize = 300;

/// Completion client backed by the Anthropic Messages API.
pub struct AnthropicClient {
    config: AiConfig,
    http: reqwest::Client,
}

impl AnthropicClient {
    pub fn new(config: AiConfig) -> Result<Self, AiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| AiError::RequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { config, http })
    }

    async fn send_once(&self, request: &CompletionRequest) -> Result<CompletionResponse, AiError> {
        let url = format!("{}/messages", self.config.base_url);
        let body = MessagesRequest {
            model: &self.config.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: &request.system,
            messages: vec![WireMessage {
                role: "user",
                content: &request.user,
            }],
        };

        let response = self
            .http
            .post(&url)
            .header("x-api-key", self.config.api_key.expose_secret())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AiError::RequestFailed {
                        reason: format!(
                            "request timed out after {:?}",
                            self.config.request_timeout
                        ),
                    }
                } else {
                    AiError::RequestFailed {
                        reason: format!("HTTP request failed: {e}"),
                    }
                }
            })?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers());
        let raw = response.text().await.map_err(|e| AiError::RequestFailed {
            reason: format!("failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), retry_after, &raw));
        }

        let decoded: MessagesResponse =
            serde_json::from_str(&raw).map_err(|e| AiError::InvalidResponse {
                reason: format!("malformed API response: {e}"),
            })?;

        let content = decoded
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");
        if content.is_empty() {
            return Err(AiError::InvalidResponse {
                reason: "response contained no text content".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: decoded.usage.input_tokens,
            output_tokens: decoded.usage.output_tokens,
        })
    }
}

#[async_trait]
impl CompletionClient for AnthropicClient {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, AiError> {
        let mut backoff_ms = self.config.backoff_base_ms;
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.send_once(&request).await {
                Ok(response) => {
                    debug!(
                        model = self.model_name(),
                        input_tokens = response.input_tokens,
                        output_tokens = response.output_tokens,
                        "Completion succeeded"
                    );
                    return Ok(response);
                }
                Err(e) if attempt >= self.config.max_attempts || !e.is_retryable() => {
                    return Err(e);
                }
                Err(e) => {
                    // Jittered backoff: base * 2^attempt + random(0..base).
                    let jitter = rand::random::<u64>() % self.config.backoff_base_ms.max(1);
                    let mut delay = Duration::from_millis(backoff_ms + jitter);
                    if let AiError::RateLimited {
                        retry_after: Some(hint),
                    } = &e
                    {
                        delay = delay.max(*hint);
                    }
                    warn!(
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Completion attempt failed, retrying"
                    );
                    sleep(delay).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }
}

/// Map a non-success HTTP response onto the upstream failure taxonomy.
fn classify_failure(status: u16, retry_after: Option<Duration>, body: &str) -> AiError {
    if status == 429 {
        return AiError::RateLimited { retry_after };
    }
    let lowered = body.to_lowercase();
    if status == 402
        || lowered.contains("billing")
        || lowered.contains("credit balance")
        || lowered.contains("quota")
    {
        return AiError::QuotaExhausted;
    }
    let preview: String = body.chars().take(ERROR_BODY_PREVIEW).collect();
    AiError::RequestFailed {
        reason: format!("HTTP {status}: {preview}"),
    }
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    system: &'a str,
    messages: Vec<WireMessage<'a>>,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct Usage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}
