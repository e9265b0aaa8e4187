//! LLM provider abstraction
//!
//! The pipeline stages need exactly one primitive: `complete(system, user)
//! -> text`. Providers differ only in endpoint and request shape.

mod anthropic;
mod openai;

pub use anthropic::AnthropicClient;
pub use openai::OpenAiClient;

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Provider error ({status}): {message}")]
    Provider { status: u16, message: String },
    #[error("Empty completion")]
    EmptyCompletion,
}

pub type LlmResult<T> = Result<T, LlmError>;

/// Common interface for LLM providers
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Make a completion request.
    async fn complete(&self, system: &str, user: &str) -> LlmResult<String>;

    /// Get the model name.
    fn model(&self) -> &str;
}

#[async_trait]
impl<T: LlmClient + ?Sized> LlmClient for Arc<T> {
    async fn complete(&self, system: &str, user: &str) -> LlmResult<String> {
        (**self).complete(system, user).await
    }

    fn model(&self) -> &str {
        (**self).model()
    }
}

/// Provider configuration from the environment
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            model: std::env::var("TELECODER_MODEL").ok(),
        }
    }

    /// Build a client from whichever key is configured; Anthropic wins
    /// when both are present. `None` means every pipeline stage degrades
    /// to its fallback.
    pub fn build(&self) -> Option<Arc<dyn LlmClient>> {
        if let Some(key) = self.anthropic_api_key.as_deref().filter(|k| !k.is_empty()) {
            return Some(Arc::new(AnthropicClient::new(
                key.to_string(),
                self.model.clone(),
            )));
        }
        if let Some(key) = self.openai_api_key.as_deref().filter(|k| !k.is_empty()) {
            return Some(Arc::new(OpenAiClient::new(
                key.to_string(),
                self.model.clone(),
            )));
        }
        None
    }
}

/// Logging wrapper for LLM clients
pub struct LoggingClient {
    inner: Arc<dyn LlmClient>,
    model: String,
}

impl LoggingClient {
    pub fn new(inner: Arc<dyn LlmClient>) -> Self {
        let model = inner.model().to_string();
        Self { inner, model }
    }
}

#[async_trait]
impl LlmClient for LoggingClient {
    async fn complete(&self, system: &str, user: &str) -> LlmResult<String> {
        let start = std::time::Instant::now();
        let result = self.inner.complete(system, user).await;
        let duration = start.elapsed();

        match &result {
            Ok(text) => {
                tracing::info!(
                    model = %self.model,
                    duration_ms = %duration.as_millis(),
                    response_chars = text.len(),
                    "LLM request completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model,
                    duration_ms = %duration.as_millis(),
                    error = %e,
                    "LLM request failed"
                );
            }
        }

        result
    }

    fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_build_prefers_anthropic() {
        let config = LlmConfig {
            anthropic_api_key: Some("a-key".to_string()),
            openai_api_key: Some("o-key".to_string()),
            model: None,
        };
        let client = config.build().unwrap();
        assert!(client.model().starts_with("claude"));
    }

    #[test]
    fn test_config_build_empty_keys_yield_none() {
        let config = LlmConfig {
            anthropic_api_key: Some(String::new()),
            openai_api_key: None,
            model: None,
        };
        assert!(config.build().is_none());
    }
}
