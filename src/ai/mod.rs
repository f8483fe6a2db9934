//! AI completion layer.
//!
//! The pipeline talks to the completion backend through the
//! [`CompletionClient`] trait so tests can substitute scripted fakes.
//! The production implementation is [`AnthropicClient`], a thin stateless
//! wrapper over the Messages HTTP API.

mod anthropic;
pub mod parser;

pub use anthropic::AnthropicClient;

use async_trait::async_trait;

use crate::error::AiError;

/// A structured-output completion request: one system instruction, one user
/// payload, and a sampling temperature.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl CompletionRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature: 0.2,
            max_tokens: 1024,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Raw completion output plus token accounting.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Stateless completion backend.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Model identifier, for logging.
    fn model_name(&self) -> &str;

    /// Issue one completion call.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, AiError>;
}
