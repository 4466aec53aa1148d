//! Runtime for executing conversations.
//!
//! Each active conversation gets one background task driving its agent loop,
//! fed turn requests over an mpsc queue (so turns within a conversation are
//! serialized) and publishing progress on a broadcast channel consumed by
//! both SSE clients and subagent waiters.

mod executor;

pub use executor::ConversationRuntime;

use crate::db::Database;
use crate::llm::ModelRegistry;
use crate::tools::{SubagentRunner, ToolRegistry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_util::sync::CancellationToken;

/// A queued unit of work for a conversation
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub id: String,
    pub text: String,
    /// Model for this turn only; `None` uses the conversation's own model
    pub model_override: Option<String>,
    pub cancel: CancellationToken,
}

impl TurnRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            model_override: None,
            cancel: CancellationToken::new(),
        }
    }
}

/// Events published by a conversation runtime
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    Message {
        message: serde_json::Value,
    },
    StateChange {
        state: String,
    },
    /// A turn finished. `text` is the agent's final text for that turn;
    /// `error` is set when the turn failed or was cancelled.
    AgentDone {
        turn_id: String,
        text: String,
        error: Option<String>,
    },
}

/// Handle to interact with a running conversation
#[derive(Clone)]
pub struct ConversationHandle {
    pub turn_tx: mpsc::Sender<TurnRequest>,
    pub broadcast_tx: broadcast::Sender<ConversationEvent>,
    cancel_slot: Arc<RwLock<CancellationToken>>,
}

impl ConversationHandle {
    /// Cancel whatever turn is currently in flight
    pub async fn cancel_current_turn(&self) {
        self.cancel_slot.read().await.cancel();
    }
}

/// Manager for all conversation runtimes
pub struct RuntimeManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    db: Database,
    llm_registry: Arc<ModelRegistry>,
    runtimes: RwLock<HashMap<String, ConversationHandle>>,
}

impl RuntimeManager {
    pub fn new(db: Database, llm_registry: Arc<ModelRegistry>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                db,
                llm_registry,
                runtimes: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Get or start the runtime for a conversation
    pub async fn get_or_create(&self, conversation_id: &str) -> Result<ConversationHandle, String> {
        ManagerInner::get_or_create(&self.inner, conversation_id).await
    }

    /// Enqueue a turn for a conversation
    pub async fn send_turn(&self, conversation_id: &str, turn: TurnRequest) -> Result<(), String> {
        let handle = self.get_or_create(conversation_id).await?;
        handle
            .turn_tx
            .send(turn)
            .await
            .map_err(|e| format!("Failed to enqueue turn: {e}"))
    }

    /// Cancel the in-flight turn of a conversation, if any
    pub async fn cancel(&self, conversation_id: &str) -> Result<(), String> {
        let runtimes = self.inner.runtimes.read().await;
        if let Some(handle) = runtimes.get(conversation_id) {
            handle.cancel_current_turn().await;
        }
        Ok(())
    }

    /// Subscribe to conversation updates
    pub async fn subscribe(
        &self,
        conversation_id: &str,
    ) -> Result<broadcast::Receiver<ConversationEvent>, String> {
        let handle = self.get_or_create(conversation_id).await?;
        Ok(handle.broadcast_tx.subscribe())
    }

    /// Get the database handle
    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    /// Get the LLM registry
    pub fn llm_registry(&self) -> &Arc<ModelRegistry> {
        &self.inner.llm_registry
    }
}

impl ManagerInner {
    async fn get_or_create(
        inner: &Arc<Self>,
        conversation_id: &str,
    ) -> Result<ConversationHandle, String> {
        let mut runtimes = inner.runtimes.write().await;
        if let Some(handle) = runtimes.get(conversation_id) {
            return Ok(handle.clone());
        }

        let conv = inner
            .db
            .get_conversation(conversation_id)
            .map_err(|e| e.to_string())?;

        let (turn_tx, turn_rx) = mpsc::channel(32);
        let (broadcast_tx, _) = broadcast::channel(128);
        let cancel_slot = Arc::new(RwLock::new(CancellationToken::new()));

        // Subagent conversations get the reduced tool set: no recursive
        // spawning from children.
        let tools = if conv.parent_conversation_id.is_some() {
            ToolRegistry::for_subagent()
        } else {
            ToolRegistry::standard(&inner.llm_registry)
        };

        let runner: Arc<dyn SubagentRunner> = Arc::new(SubagentDispatcher {
            manager: Arc::downgrade(inner),
        });

        let runtime = ConversationRuntime::new(
            conv.id.clone(),
            inner.db.clone(),
            inner.llm_registry.clone(),
            tools,
            runner,
            turn_rx,
            broadcast_tx.clone(),
            cancel_slot.clone(),
        );

        let conv_id = conversation_id.to_string();
        tokio::spawn(async move {
            runtime.run().await;
            tracing::info!(conv_id = %conv_id, "Conversation runtime finished");
        });

        let handle = ConversationHandle {
            turn_tx,
            broadcast_tx,
            cancel_slot,
        };
        runtimes.insert(conversation_id.to_string(), handle.clone());
        Ok(handle)
    }
}

/// `SubagentRunner` backed by the runtime manager.
///
/// Holds a `Weak` reference: tools are owned (transitively) by runtimes the
/// manager spawns, so a strong reference here would cycle.
struct SubagentDispatcher {
    manager: Weak<ManagerInner>,
}

#[async_trait]
impl SubagentRunner for SubagentDispatcher {
    async fn run(
        &self,
        cancel: CancellationToken,
        conversation_id: &str,
        prompt: &str,
        wait: bool,
        timeout: Duration,
        model_id: &str,
    ) -> Result<String, String> {
        let Some(inner) = self.manager.upgrade() else {
            return Err("runtime manager is shut down".to_string());
        };

        let handle = ManagerInner::get_or_create(&inner, conversation_id).await?;
        drop(inner);

        // Subscribe before enqueueing so the completion event cannot be missed
        let mut events = handle.broadcast_tx.subscribe();

        let turn_id = uuid::Uuid::new_v4().to_string();
        // The child's turn runs under a token derived from the caller's, so
        // caller cancellation tears the child's work down. The wait deadline
        // below deliberately does not touch this token.
        let turn = TurnRequest {
            id: turn_id.clone(),
            text: prompt.to_string(),
            model_override: Some(model_id.to_string()),
            cancel: cancel.child_token(),
        };
        handle
            .turn_tx
            .send(turn)
            .await
            .map_err(|_| "subagent runtime is not accepting work".to_string())?;

        if !wait {
            return Ok(format!(
                "Prompt delivered to subagent conversation {conversation_id}; it is working in the background."
            ));
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    return Err("cancelled while waiting for subagent".to_string());
                }
                () = &mut deadline => {
                    return Ok(format!(
                        "No response within {} seconds. The subagent is still working; send another message with the same slug to check on it.",
                        timeout.as_secs()
                    ));
                }
                event = events.recv() => match event {
                    Ok(ConversationEvent::AgentDone { turn_id: done_id, text, error }) if done_id == turn_id => {
                        return match error {
                            None => Ok(text),
                            Some(e) => Err(e),
                        };
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err("subagent runtime stopped unexpectedly".to_string());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ContentBlock, LlmError, LlmRequest, LlmResponse, LlmService, Usage};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// LLM double that replays queued responses, optionally after a delay
    struct ScriptedLlm {
        responses: Mutex<VecDeque<LlmResponse>>,
        delay: Duration,
    }

    impl ScriptedLlm {
        fn replying(texts: &[&str]) -> Arc<Self> {
            Self::replying_after(texts, Duration::ZERO)
        }

        fn replying_after(texts: &[&str], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(
                    texts
                        .iter()
                        .map(|t| LlmResponse {
                            content: vec![ContentBlock::text(*t)],
                            end_turn: true,
                            usage: Usage::default(),
                        })
                        .collect(),
                ),
                delay,
            })
        }
    }

    #[async_trait]
    impl LlmService for ScriptedLlm {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| LlmError::unknown("script exhausted"))
        }

        fn model_id(&self) -> &str {
            "mock-model"
        }
    }

    fn manager_with(llm: Arc<ScriptedLlm>) -> RuntimeManager {
        let db = Database::open_in_memory().unwrap();
        db.create_conversation("root", "/tmp", "mock-model", true, None, None)
            .unwrap();
        let registry = Arc::new(ModelRegistry::with_services(
            vec![("mock-model", "Mock Model", llm)],
            "mock-model",
        ));
        RuntimeManager::new(db, registry)
    }

    async fn await_agent_done(
        events: &mut broadcast::Receiver<ConversationEvent>,
    ) -> (String, Option<String>) {
        loop {
            match events.recv().await.unwrap() {
                ConversationEvent::AgentDone { text, error, .. } => return (text, error),
                _ => {}
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_produces_agent_done() {
        let manager = manager_with(ScriptedLlm::replying(&["Hello from the agent"]));

        let mut events = manager.subscribe("root").await.unwrap();
        manager
            .send_turn("root", TurnRequest::new("hi"))
            .await
            .unwrap();

        let (text, error) = await_agent_done(&mut events).await;
        assert_eq!(text, "Hello from the agent");
        assert!(error.is_none());

        // User and agent messages were persisted, and the conversation is idle
        let messages = manager.db().get_messages("root").unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(
            manager.db().get_conversation("root").unwrap().state,
            crate::db::ConversationState::Idle
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_model_fails_turn() {
        let manager = manager_with(ScriptedLlm::replying(&["unused"]));

        let mut events = manager.subscribe("root").await.unwrap();
        let mut turn = TurnRequest::new("hi");
        turn.model_override = Some("missing-model".to_string());
        manager.send_turn("root", turn).await.unwrap();

        let (_, error) = await_agent_done(&mut events).await;
        assert!(error.unwrap().contains("missing-model"));
    }

    fn dispatcher_for(manager: &RuntimeManager) -> SubagentDispatcher {
        SubagentDispatcher {
            manager: Arc::downgrade(&manager.inner),
        }
    }

    fn bind_child(manager: &RuntimeManager) -> String {
        manager
            .db()
            .resolve_or_create_subagent("root", "helper", "/tmp", false)
            .unwrap()
            .0
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_wait_returns_child_text() {
        let manager = manager_with(ScriptedLlm::replying(&["Child result"]));
        let child_id = bind_child(&manager);

        let result = dispatcher_for(&manager)
            .run(
                CancellationToken::new(),
                &child_id,
                "do the thing",
                true,
                Duration::from_secs(60),
                "mock-model",
            )
            .await;

        assert_eq!(result.unwrap(), "Child result");

        // The child's history holds the dispatched prompt
        let messages = manager.db().get_messages(&child_id).unwrap();
        assert_eq!(messages[0].content["text"], "do the thing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_no_wait_returns_promptly() {
        let manager = manager_with(ScriptedLlm::replying_after(
            &["Eventually"],
            Duration::from_millis(500),
        ));
        let child_id = bind_child(&manager);

        let mut events = manager.subscribe(&child_id).await.unwrap();
        let result = dispatcher_for(&manager)
            .run(
                CancellationToken::new(),
                &child_id,
                "work in background",
                false,
                Duration::from_secs(60),
                "mock-model",
            )
            .await;

        assert!(result.unwrap().contains("working in the background"));

        // The child still completes on its own
        let (text, error) = await_agent_done(&mut events).await;
        assert_eq!(text, "Eventually");
        assert!(error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_timeout_leaves_child_running() {
        let manager = manager_with(ScriptedLlm::replying_after(
            &["Late answer"],
            Duration::from_millis(500),
        ));
        let child_id = bind_child(&manager);

        let mut events = manager.subscribe(&child_id).await.unwrap();
        let result = dispatcher_for(&manager)
            .run(
                CancellationToken::new(),
                &child_id,
                "slow task",
                true,
                Duration::from_millis(50),
                "mock-model",
            )
            .await;

        // Timeout is a status, not an error
        assert!(result.unwrap().contains("still working"));

        // ...and the child finishes in the background
        let (text, error) = await_agent_done(&mut events).await;
        assert_eq!(text, "Late answer");
        assert!(error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_tears_child_down() {
        let manager = manager_with(ScriptedLlm::replying_after(
            &["Never delivered"],
            Duration::from_secs(30),
        ));
        let child_id = bind_child(&manager);

        let mut events = manager.subscribe(&child_id).await.unwrap();
        let cancel = CancellationToken::new();
        let dispatcher = dispatcher_for(&manager);

        let canceller = cancel.clone();
        let child = child_id.clone();
        let waiter = tokio::spawn(async move {
            dispatcher
                .run(
                    canceller,
                    &child,
                    "doomed task",
                    true,
                    Duration::from_secs(60),
                    "mock-model",
                )
                .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(result.unwrap_err().contains("cancelled"));

        // The child's turn aborted too, rather than running to completion
        let (_, error) = await_agent_done(&mut events).await;
        assert_eq!(error.as_deref(), Some("cancelled"));
    }
}
