//! Anthropic Claude provider implementation

use super::types::{ContentBlock, LlmMessage, LlmRequest, LlmResponse, MessageRole, Usage};
use super::{LlmError, LlmService};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Anthropic model variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnthropicModel {
    Claude45Opus,
    Claude45Sonnet,
    Claude45Haiku,
}

impl AnthropicModel {
    /// All models, in the order they are presented to clients
    pub const ALL: [AnthropicModel; 3] = [
        AnthropicModel::Claude45Sonnet,
        AnthropicModel::Claude45Opus,
        AnthropicModel::Claude45Haiku,
    ];

    pub fn api_name(self) -> &'static str {
        match self {
            AnthropicModel::Claude45Opus => "claude-opus-4-5-20251101",
            AnthropicModel::Claude45Sonnet => "claude-sonnet-4-5-20250929",
            AnthropicModel::Claude45Haiku => "claude-haiku-4-5-20251001",
        }
    }

    pub fn model_id(self) -> &'static str {
        match self {
            AnthropicModel::Claude45Opus => "claude-4.5-opus",
            AnthropicModel::Claude45Sonnet => "claude-4.5-sonnet",
            AnthropicModel::Claude45Haiku => "claude-4.5-haiku",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            AnthropicModel::Claude45Opus => "Claude Opus 4.5",
            AnthropicModel::Claude45Sonnet => "Claude Sonnet 4.5",
            AnthropicModel::Claude45Haiku => "Claude Haiku 4.5",
        }
    }
}

/// Anthropic service implementation
pub struct AnthropicService {
    client: Client,
    api_key: String,
    model: AnthropicModel,
    base_url: String,
}

impl AnthropicService {
    pub fn new(api_key: String, model: AnthropicModel, gateway: Option<&str>) -> Self {
        let base_url = match gateway {
            Some(gw) => format!("{}/anthropic/v1/messages", gw.trim_end_matches('/')),
            None => "https://api.anthropic.com/v1/messages".to_string(),
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_key,
            model,
            base_url,
        }
    }

    fn translate_request(&self, request: &LlmRequest) -> WireRequest {
        let system = request
            .system
            .iter()
            .map(|s| WireSystemBlock {
                r#type: "text".to_string(),
                text: s.text.clone(),
                cache_control: s.cache.then(|| CacheControl {
                    r#type: "ephemeral".to_string(),
                }),
            })
            .collect();

        let messages = request
            .messages
            .iter()
            .map(Self::translate_message)
            .collect();

        let tools: Vec<WireTool> = request
            .tools
            .iter()
            .map(|t| WireTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
            })
            .collect();

        WireRequest {
            model: self.model.api_name().to_string(),
            max_tokens: request.max_tokens.unwrap_or(8192),
            system,
            messages,
            tools: (!tools.is_empty()).then_some(tools),
        }
    }

    fn translate_message(msg: &LlmMessage) -> WireMessage {
        let role = match msg.role {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        };

        let content = msg
            .content
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => WireContentBlock::Text { text: text.clone() },
                ContentBlock::ToolUse { id, name, input } => WireContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                },
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => WireContentBlock::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: content.clone(),
                    is_error: *is_error,
                },
            })
            .collect();

        WireMessage {
            role: role.to_string(),
            content,
        }
    }

    fn normalize_response(resp: WireResponse) -> Result<LlmResponse, LlmError> {
        let mut content = Vec::new();

        for block in resp.content {
            match block {
                WireContentBlock::Text { text } => {
                    if !text.is_empty() {
                        content.push(ContentBlock::Text { text });
                    }
                }
                WireContentBlock::ToolUse { id, name, input } => {
                    content.push(ContentBlock::ToolUse { id, name, input });
                }
                WireContentBlock::ToolResult { .. } => {
                    return Err(LlmError::unknown(
                        "Unexpected tool_result block in Anthropic response",
                    ));
                }
            }
        }

        if content.is_empty() {
            tracing::warn!(
                stop_reason = ?resp.stop_reason,
                output_tokens = resp.usage.output_tokens,
                "Anthropic returned empty content after normalization"
            );
            return Err(LlmError::unknown(format!(
                "Anthropic returned an empty response (stop_reason={:?})",
                resp.stop_reason
            )));
        }

        Ok(LlmResponse {
            end_turn: resp.stop_reason.as_deref() == Some("end_turn"),
            content,
            usage: Usage {
                input_tokens: resp.usage.input_tokens,
                output_tokens: resp.usage.output_tokens,
                cache_creation_tokens: resp.usage.cache_creation_input_tokens.unwrap_or(0),
                cache_read_tokens: resp.usage.cache_read_input_tokens.unwrap_or(0),
            },
        })
    }

    fn classify_error(status: reqwest::StatusCode, body: &str) -> LlmError {
        match status.as_u16() {
            401 | 403 => LlmError::auth(format!("Authentication failed: {body}")),
            429 => LlmError::rate_limit(format!("Rate limited: {body}")),
            400 => LlmError::invalid_request(format!("Invalid request: {body}")),
            500..=599 => LlmError::server_error(format!("Server error: {body}")),
            _ => LlmError::unknown(format!("HTTP {status}: {body}")),
        }
    }
}

#[async_trait]
impl LlmService for AnthropicService {
    async fn complete(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let wire_request = self.translate_request(request);

        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(&wire_request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network(format!("Request timeout: {e}"))
                } else if e.is_connect() {
                    LlmError::network(format!("Connection failed: {e}"))
                } else {
                    LlmError::unknown(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(Self::classify_error(status, &body));
        }

        let wire_response: WireResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::unknown(format!("Failed to parse response: {e}")))?;

        Self::normalize_response(wire_response)
    }

    fn model_id(&self) -> &str {
        self.model.model_id()
    }
}

// Anthropic API wire types

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    max_tokens: u32,
    system: Vec<WireSystemBlock>,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize)]
struct WireSystemBlock {
    r#type: String,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Serialize)]
struct CacheControl {
    r#type: String,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: Vec<WireContentBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    content: Vec<WireContentBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    input_tokens: u64,
    output_tokens: u64,
    cache_creation_input_tokens: Option<u64>,
    cache_read_input_tokens: Option<u64>,
}
