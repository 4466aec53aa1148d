//! LLM provider abstraction
//!
//! Provides a common interface for interacting with LLM providers.

mod anthropic;
mod error;
mod registry;
mod types;

pub use error::{LlmError, LlmErrorKind};
pub use registry::{AvailableModel, LlmConfig, ModelRegistry};
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

/// Common interface for LLM providers
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Make a completion request
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

/// Logging wrapper for LLM services
pub struct LoggingService {
    inner: Arc<dyn LlmService>,
    model_id: String,
}

impl LoggingService {
    pub fn new(inner: Arc<dyn LlmService>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LlmService for LoggingService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let started = Instant::now();
        let result = self.inner.complete(request).await;
        let elapsed_ms = started.elapsed().as_millis();

        match &result {
            Ok(response) => {
                tracing::info!(
                    model = %self.model_id,
                    elapsed_ms,
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    end_turn = response.end_turn,
                    "LLM completion"
                );
            }
            Err(e) => {
                tracing::warn!(
                    model = %self.model_id,
                    elapsed_ms,
                    kind = ?e.kind,
                    error = %e.message,
                    "LLM completion failed"
                );
            }
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
