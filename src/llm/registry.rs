//! Model registry: the ordered set of models a conversation (or subagent) may use

use super::anthropic::{AnthropicModel, AnthropicService};
use super::{LlmService, LoggingService};
use std::sync::Arc;

/// Configuration for LLM providers
#[derive(Debug, Clone, Default)]
pub struct LlmConfig {
    pub anthropic_api_key: Option<String>,
    /// Gateway base URL; when set, authentication is delegated to the gateway
    pub gateway: Option<String>,
    /// Default model ID
    pub default_model: Option<String>,
}

impl LlmConfig {
    pub fn from_env() -> Self {
        Self {
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            gateway: std::env::var("LLM_GATEWAY").ok(),
            default_model: std::env::var("DEFAULT_MODEL").ok(),
        }
    }
}

/// A model as presented to clients and to the subagent tool descriptor.
///
/// `display_name` is presentational; empty (or equal to `id`) means the model
/// renders by id alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailableModel {
    pub id: String,
    pub display_name: String,
}

struct RegistryEntry {
    id: String,
    display_name: String,
    service: Arc<dyn LlmService>,
}

/// Registry of available LLM models.
///
/// Backed by a `Vec` rather than a map: registration order is meaningful (it
/// drives the model list in the subagent tool description) and the set is
/// small enough that linear lookup is the simpler discipline.
pub struct ModelRegistry {
    entries: Vec<RegistryEntry>,
    default_model: String,
}

impl ModelRegistry {
    pub fn new(config: &LlmConfig) -> Self {
        let mut entries = Vec::new();

        let api_key = if config.gateway.is_some() {
            Some("implicit".to_string())
        } else {
            config.anthropic_api_key.clone()
        };

        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            for model in AnthropicModel::ALL {
                let service = AnthropicService::new(key.clone(), model, config.gateway.as_deref());
                entries.push(RegistryEntry {
                    id: model.model_id().to_string(),
                    display_name: model.display_name().to_string(),
                    service: Arc::new(LoggingService::new(Arc::new(service))),
                });
            }
        }

        let default_model = config
            .default_model
            .clone()
            .or_else(|| entries.first().map(|e| e.id.clone()))
            .unwrap_or_else(|| "claude-4.5-sonnet".to_string());

        Self {
            entries,
            default_model,
        }
    }

    /// Create an empty registry (no models configured)
    pub fn new_empty() -> Self {
        Self {
            entries: Vec::new(),
            default_model: "test-model".to_string(),
        }
    }

    /// Build a registry from explicit services, preserving the given order.
    #[cfg(test)]
    pub fn with_services(
        services: Vec<(&str, &str, Arc<dyn LlmService>)>,
        default_model: &str,
    ) -> Self {
        Self {
            entries: services
                .into_iter()
                .map(|(id, display_name, service)| RegistryEntry {
                    id: id.to_string(),
                    display_name: display_name.to_string(),
                    service,
                })
                .collect(),
            default_model: default_model.to_string(),
        }
    }

    /// Get a model's service by ID
    pub fn get(&self, model_id: &str) -> Option<Arc<dyn LlmService>> {
        self.entries
            .iter()
            .find(|e| e.id == model_id)
            .map(|e| e.service.clone())
    }

    /// Get the default model ID
    pub fn default_model_id(&self) -> &str {
        &self.default_model
    }

    /// All models in registration order
    pub fn available_models(&self) -> Vec<AvailableModel> {
        self.entries
            .iter()
            .map(|e| AvailableModel {
                id: e.id.clone(),
                display_name: e.display_name.clone(),
            })
            .collect()
    }

    /// Check that `model_id` names a registered model.
    ///
    /// On failure returns the full list of known ids so callers can build a
    /// descriptive error.
    pub fn validate_model(&self, model_id: &str) -> Result<(), Vec<String>> {
        if self.entries.iter().any(|e| e.id == model_id) {
            Ok(())
        } else {
            Err(self.entries.iter().map(|e| e.id.clone()).collect())
        }
    }

    /// Check if any models are available
    pub fn has_models(&self) -> bool {
        !self.entries.is_empty()
    }
}
