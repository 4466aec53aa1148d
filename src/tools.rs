//! Tool implementations.
//!
//! Tools are stateless singletons; everything a call needs arrives through
//! `ToolContext`, built fresh by the runtime for each invocation.

mod bash;
mod subagent;
mod think;

pub use bash::BashTool;
pub use subagent::{sanitize_slug, SubagentRunner, SubagentTool};
pub use think::ThinkTool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::db::Database;
use crate::llm::ModelRegistry;

/// Result from tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_data: Option<Value>,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            display_data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            display_data: None,
        }
    }

    pub fn with_display(mut self, data: Value) -> Self {
        self.display_data = Some(data);
        self
    }
}

/// All context needed for a tool invocation.
///
/// Created fresh for each tool call. `working_dir` and `model_id` are read
/// from the conversation at call time, so a conversation whose directory has
/// moved hands new bindings the latest value without mutating old ones.
#[derive(Clone)]
pub struct ToolContext {
    /// Cancellation signal for long-running operations
    pub cancel: CancellationToken,

    /// The conversation this tool is executing within
    pub conversation_id: String,

    /// Working directory for file operations
    pub working_dir: PathBuf,

    /// The conversation's current model id
    pub model_id: String,

    /// Database handle; also serves as the subagent directory
    db: Database,

    /// Model registry, for tools that reflect over available models
    llm_registry: Arc<ModelRegistry>,

    /// Injected executor for subagent dispatch
    subagent_runner: Arc<dyn SubagentRunner>,
}

impl ToolContext {
    pub fn new(
        cancel: CancellationToken,
        conversation_id: String,
        working_dir: PathBuf,
        model_id: String,
        db: Database,
        llm_registry: Arc<ModelRegistry>,
        subagent_runner: Arc<dyn SubagentRunner>,
    ) -> Self {
        Self {
            cancel,
            conversation_id,
            working_dir,
            model_id,
            db,
            llm_registry,
            subagent_runner,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn llm_registry(&self) -> &Arc<ModelRegistry> {
        &self.llm_registry
    }

    pub fn subagent_runner(&self) -> &Arc<dyn SubagentRunner> {
        &self.subagent_runner
    }
}

/// Trait for tools that can be executed by the agent
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &str;

    /// Tool description for the LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Execute the tool with all context provided via `ToolContext`.
    ///
    /// Long-running tools should observe `ctx.cancel` and wind down promptly
    /// when it fires.
    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}

/// Collection of tools available to a conversation
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Tool set for top-level conversations
    pub fn standard(llm_registry: &Arc<ModelRegistry>) -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ThinkTool),
            Arc::new(BashTool),
            Arc::new(SubagentTool::new(llm_registry.clone())),
        ];
        Self { tools }
    }

    /// Tool set for subagent conversations: no recursive spawning
    pub fn for_subagent() -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(ThinkTool), Arc::new(BashTool)];
        Self { tools }
    }

    /// Get all tool definitions for the LLM
    pub fn definitions(&self) -> Vec<crate::llm::ToolDefinition> {
        self.tools
            .iter()
            .map(|t| crate::llm::ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name with context
    pub async fn execute(&self, name: &str, input: Value, ctx: ToolContext) -> Option<ToolOutput> {
        for tool in &self.tools {
            if tool.name() == name {
                return Some(tool.run(input, ctx).await);
            }
        }
        None
    }
}
