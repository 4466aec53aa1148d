//! Conversation runtime executor: the agent loop for one conversation

use super::{ConversationEvent, TurnRequest};
use crate::db::{Conversation, ConversationState, Database, MessageType, UsageData};
use crate::llm::{
    ContentBlock, LlmMessage, LlmRequest, MessageRole, ModelRegistry, SystemContent,
};
use crate::tools::{SubagentRunner, ToolContext, ToolRegistry};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;

const SYSTEM_PROMPT: &str = "You are a coding assistant with access to tools for running shell commands and delegating work to subagents. Use tools when they help you accomplish the user's task, and answer directly when they do not.";

const MAX_TOKENS: u32 = 8192;

pub struct ConversationRuntime {
    conversation_id: String,
    db: Database,
    llm_registry: Arc<ModelRegistry>,
    tools: ToolRegistry,
    subagent_runner: Arc<dyn SubagentRunner>,
    turn_rx: mpsc::Receiver<TurnRequest>,
    broadcast_tx: broadcast::Sender<ConversationEvent>,
    cancel_slot: Arc<RwLock<CancellationToken>>,
}

impl ConversationRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conversation_id: String,
        db: Database,
        llm_registry: Arc<ModelRegistry>,
        tools: ToolRegistry,
        subagent_runner: Arc<dyn SubagentRunner>,
        turn_rx: mpsc::Receiver<TurnRequest>,
        broadcast_tx: broadcast::Sender<ConversationEvent>,
        cancel_slot: Arc<RwLock<CancellationToken>>,
    ) -> Self {
        Self {
            conversation_id,
            db,
            llm_registry,
            tools,
            subagent_runner,
            turn_rx,
            broadcast_tx,
            cancel_slot,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(conv_id = %self.conversation_id, "Starting conversation runtime");

        while let Some(turn) = self.turn_rx.recv().await {
            // Expose this turn's token so the cancel endpoint can reach it
            *self.cancel_slot.write().await = turn.cancel.clone();

            self.set_state(ConversationState::Working);
            if let Err(e) = self.persist_message(
                MessageType::User,
                &json!({"text": turn.text.as_str()}),
                None,
                None,
            ) {
                tracing::error!(conv_id = %self.conversation_id, error = %e, "Failed to persist user message");
            }

            match self.run_agent_loop(&turn).await {
                Ok(text) => {
                    self.set_state(ConversationState::Idle);
                    let _ = self.broadcast_tx.send(ConversationEvent::AgentDone {
                        turn_id: turn.id.clone(),
                        text,
                        error: None,
                    });
                }
                Err(e) => {
                    tracing::warn!(conv_id = %self.conversation_id, error = %e, "Turn failed");
                    let _ = self.persist_message(
                        MessageType::Error,
                        &json!({"message": e.as_str()}),
                        None,
                        None,
                    );
                    self.set_state(ConversationState::Error);
                    let _ = self.broadcast_tx.send(ConversationEvent::AgentDone {
                        turn_id: turn.id.clone(),
                        text: String::new(),
                        error: Some(e),
                    });
                }
            }
        }

        tracing::info!(conv_id = %self.conversation_id, "Conversation runtime stopped");
    }

    async fn run_agent_loop(&self, turn: &TurnRequest) -> Result<String, String> {
        // Working directory and model are read once per turn; a binding made
        // mid-turn sees these values, later turns re-read them.
        let conv = self
            .db
            .get_conversation(&self.conversation_id)
            .map_err(|e| e.to_string())?;
        let model_id = turn
            .model_override
            .clone()
            .unwrap_or_else(|| conv.model.clone());
        let llm = self
            .llm_registry
            .get(&model_id)
            .ok_or_else(|| format!("Model '{model_id}' is not available"))?;

        let mut last_text = String::new();

        loop {
            if turn.cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }

            let request = LlmRequest {
                system: vec![SystemContent::cached(SYSTEM_PROMPT)],
                messages: Self::build_llm_messages(&self.db, &self.conversation_id)?,
                tools: self.tools.definitions(),
                max_tokens: Some(MAX_TOKENS),
            };

            let response = tokio::select! {
                result = llm.complete(&request) => result.map_err(|e| e.to_string())?,
                () = turn.cancel.cancelled() => return Err("cancelled".to_string()),
            };

            let content_json = serde_json::to_value(&response.content)
                .map_err(|e| format!("Failed to serialize agent content: {e}"))?;
            let usage = UsageData {
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
                cache_creation_tokens: response.usage.cache_creation_tokens,
                cache_read_tokens: response.usage.cache_read_tokens,
            };
            self.persist_message(MessageType::Agent, &content_json, None, Some(&usage))?;

            let text = response.text();
            if !text.is_empty() {
                last_text = text;
            }

            let tool_uses: Vec<(String, String, Value)> = response
                .tool_uses()
                .into_iter()
                .map(|(id, name, input)| (id.to_string(), name.to_string(), input.clone()))
                .collect();
            if tool_uses.is_empty() {
                return Ok(last_text);
            }

            for (tool_use_id, name, input) in tool_uses {
                if turn.cancel.is_cancelled() {
                    // Keep the protocol consistent: every tool_use gets a result
                    self.persist_message(
                        MessageType::Tool,
                        &json!({
                            "tool_use_id": tool_use_id,
                            "content": "Cancelled before execution",
                            "is_error": true,
                        }),
                        None,
                        None,
                    )?;
                    continue;
                }

                tracing::info!(conv_id = %self.conversation_id, tool = %name, id = %tool_use_id, "Executing tool");
                let ctx = self.tool_context(&turn.cancel, &conv, &model_id);
                let output = self.tools.execute(&name, input, ctx).await;

                let (content, is_error, display_data) = match output {
                    Some(out) => (out.output, !out.success, out.display_data),
                    None => (format!("Unknown tool: {name}"), true, None),
                };
                self.persist_message(
                    MessageType::Tool,
                    &json!({
                        "tool_use_id": tool_use_id,
                        "content": content,
                        "is_error": is_error,
                    }),
                    display_data.as_ref(),
                    None,
                )?;
            }

            if turn.cancel.is_cancelled() {
                return Err("cancelled".to_string());
            }
        }
    }

    fn tool_context(
        &self,
        cancel: &CancellationToken,
        conv: &Conversation,
        model_id: &str,
    ) -> ToolContext {
        ToolContext::new(
            cancel.clone(),
            self.conversation_id.clone(),
            PathBuf::from(&conv.cwd),
            model_id.to_string(),
            self.db.clone(),
            self.llm_registry.clone(),
            self.subagent_runner.clone(),
        )
    }

    /// Reconstruct the LLM message history from persisted messages
    fn build_llm_messages(db: &Database, conversation_id: &str) -> Result<Vec<LlmMessage>, String> {
        let db_messages = db.get_messages(conversation_id).map_err(|e| e.to_string())?;

        let mut messages = Vec::new();
        for msg in db_messages {
            match msg.message_type {
                MessageType::User => {
                    let text = msg
                        .content
                        .get("text")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default();
                    messages.push(LlmMessage {
                        role: MessageRole::User,
                        content: vec![ContentBlock::text(text)],
                    });
                }

                MessageType::Agent => {
                    let content: Vec<ContentBlock> = serde_json::from_value(msg.content.clone())
                        .unwrap_or_else(|_| vec![ContentBlock::text(msg.content.to_string())]);
                    messages.push(LlmMessage {
                        role: MessageRole::Assistant,
                        content,
                    });
                }

                MessageType::Tool => {
                    // Tool results travel in a user-role message
                    let tool_use_id = msg
                        .content
                        .get("tool_use_id")
                        .and_then(|t| t.as_str())
                        .unwrap_or_default();
                    let content = msg
                        .content
                        .get("content")
                        .and_then(|c| c.as_str())
                        .unwrap_or_default();
                    let is_error = msg
                        .content
                        .get("is_error")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    messages.push(LlmMessage {
                        role: MessageRole::User,
                        content: vec![ContentBlock::tool_result(tool_use_id, content, is_error)],
                    });
                }

                MessageType::Error => {}
            }
        }

        Ok(messages)
    }

    fn persist_message(
        &self,
        msg_type: MessageType,
        content: &Value,
        display_data: Option<&Value>,
        usage_data: Option<&UsageData>,
    ) -> Result<(), String> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = self
            .db
            .add_message(&id, &self.conversation_id, msg_type, content, display_data, usage_data)
            .map_err(|e| e.to_string())?;

        let message = serde_json::to_value(&msg).unwrap_or(Value::Null);
        let _ = self
            .broadcast_tx
            .send(ConversationEvent::Message { message });
        Ok(())
    }

    fn set_state(&self, state: ConversationState) {
        if let Err(e) = self.db.update_conversation_state(&self.conversation_id, state) {
            tracing::error!(conv_id = %self.conversation_id, error = %e, "Failed to persist state");
        }
        let _ = self.broadcast_tx.send(ConversationEvent::StateChange {
            state: state.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_build_llm_messages_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        db.create_conversation("c", "/tmp", "claude-4.5-sonnet", true, None, None)
            .unwrap();

        db.add_message("m1", "c", MessageType::User, &json!({"text": "hi"}), None, None)
            .unwrap();
        db.add_message(
            "m2",
            "c",
            MessageType::Agent,
            &json!([
                {"type": "text", "text": "checking"},
                {"type": "tool_use", "id": "tu1", "name": "bash", "input": {"command": "ls"}}
            ]),
            None,
            None,
        )
        .unwrap();
        db.add_message(
            "m3",
            "c",
            MessageType::Tool,
            &json!({"tool_use_id": "tu1", "content": "file.txt", "is_error": false}),
            None,
            None,
        )
        .unwrap();
        // Error messages are invisible to the model
        db.add_message("m4", "c", MessageType::Error, &json!({"message": "boom"}), None, None)
            .unwrap();

        let messages = ConversationRuntime::build_llm_messages(&db, "c").unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);
        assert_eq!(messages[1].content.len(), 2);
        assert_eq!(messages[2].role, MessageRole::User);
        assert!(matches!(
            messages[2].content[0],
            ContentBlock::ToolResult { ref tool_use_id, .. } if tool_use_id == "tu1"
        ));
    }
}
