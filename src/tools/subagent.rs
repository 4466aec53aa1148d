//! Subagent tool: spawn or continue an independent child conversation.
//!
//! A child is addressed by a slug scoped to the parent conversation. The
//! first call with a new slug allocates a child through the subagent
//! directory (`Database::resolve_or_create_subagent`); later calls with the
//! same slug reach the same child. Dispatch goes through the injected
//! [`SubagentRunner`] so this module never depends on the runtime that
//! ultimately drives the child's agent loop.

use super::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::llm::ModelRegistry;

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const MAX_TIMEOUT_SECS: u64 = 300;

/// Normalize a requested subagent identifier to slug form.
///
/// Lowercases, maps spaces and underscores to hyphens, drops everything
/// outside `[a-z0-9-]`, collapses hyphen runs, and trims hyphens from both
/// ends. The result may be empty; callers treat that as invalid input.
pub fn sanitize_slug(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        let c = match c {
            ' ' | '_' => '-',
            other => match other.to_ascii_lowercase() {
                l if l.is_ascii_lowercase() || l.is_ascii_digit() || l == '-' => l,
                _ => continue,
            },
        };
        if c == '-' && out.ends_with('-') {
            continue;
        }
        out.push(c);
    }
    // A single trailing hyphen can remain after the collapse pass
    while out.starts_with('-') {
        out.remove(0);
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}

/// Executor for one subagent turn, implemented by the conversation runtime.
///
/// Injected rather than imported: the runtime constructs tools, so the tool
/// layer cannot depend on it structurally.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    /// Dispatch `prompt` to the child conversation.
    ///
    /// With `wait` true, blocks until the child finishes its turn, `timeout`
    /// elapses, or `cancel` fires, and returns the child's final text. On
    /// timeout a still-working status is returned and the child keeps
    /// running. With `wait` false, enqueues the prompt and returns a status
    /// string promptly.
    ///
    /// Cancellation must propagate into the child's own execution; timeout
    /// must not.
    async fn run(
        &self,
        cancel: CancellationToken,
        conversation_id: &str,
        prompt: &str,
        wait: bool,
        timeout: Duration,
        model_id: &str,
    ) -> Result<String, String>;
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SubagentInput {
    slug: String,
    prompt: String,
    timeout_seconds: Option<i64>,
    wait: Option<bool>,
    model: Option<String>,
}

/// Tool for delegating work to subagent conversations
pub struct SubagentTool {
    models: Arc<ModelRegistry>,
}

impl SubagentTool {
    pub fn new(models: Arc<ModelRegistry>) -> Self {
        Self { models }
    }
}

const DESCRIPTION_PREAMBLE: &str = "\
Send a prompt to a subagent: an independent conversation that shares your \
working directory and runs its own agent loop. The first message with a new \
slug creates the subagent; later messages with the same slug continue it. \
With wait=true (the default) the call returns the subagent's response. With \
wait=false the prompt is delivered and the subagent works in the background. \
If a wait times out the subagent keeps working; send another message with \
the same slug to collect its result.";

#[async_trait]
impl Tool for SubagentTool {
    fn name(&self) -> &'static str {
        "subagent"
    }

    fn description(&self) -> String {
        let models = self.models.available_models();
        if models.is_empty() {
            return DESCRIPTION_PREAMBLE.to_string();
        }

        let mut description = format!("{DESCRIPTION_PREAMBLE}\n\nAvailable models:\n");
        for model in &models {
            if model.display_name.is_empty() || model.display_name == model.id {
                description.push_str(&format!("- {}\n", model.id));
            } else {
                description.push_str(&format!("- {} ({})\n", model.id, model.display_name));
            }
        }
        description.truncate(description.trim_end().len());
        description
    }

    fn input_schema(&self) -> Value {
        let mut properties = json!({
            "slug": {
                "type": "string",
                "description": "Short identifier for the subagent; reuse it to continue the same subagent"
            },
            "prompt": {
                "type": "string",
                "description": "The message to send to the subagent"
            },
            "timeout_seconds": {
                "type": "integer",
                "description": "How long to wait for the response (default 60, max 300)"
            },
            "wait": {
                "type": "boolean",
                "description": "Wait for the subagent's response (default true)"
            }
        });

        let model_ids: Vec<String> = self
            .models
            .available_models()
            .into_iter()
            .map(|m| m.id)
            .collect();
        if !model_ids.is_empty() {
            properties["model"] = json!({
                "type": "string",
                "enum": model_ids,
                "description": "Model for the subagent (defaults to this conversation's model)"
            });
        }

        json!({
            "type": "object",
            "required": ["slug", "prompt"],
            "properties": properties
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: SubagentInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("failed to parse subagent input: {e}")),
        };

        if input.slug.is_empty() {
            return ToolOutput::error("slug is required");
        }
        if input.prompt.is_empty() {
            return ToolOutput::error("prompt is required");
        }

        let requested_slug = sanitize_slug(&input.slug);
        if requested_slug.is_empty() {
            return ToolOutput::error("slug must contain alphanumeric characters");
        }

        let timeout_secs = match input.timeout_seconds {
            Some(s) if s > 0 => u64::try_from(s).unwrap_or(MAX_TIMEOUT_SECS).min(MAX_TIMEOUT_SECS),
            _ => DEFAULT_TIMEOUT_SECS,
        };
        let wait = input.wait.unwrap_or(true);

        let mut model_id = ctx.model_id.clone();
        if let Some(requested) = input.model.as_deref().filter(|m| !m.is_empty()) {
            if self.models.has_models() {
                if let Err(known) = self.models.validate_model(requested) {
                    return ToolOutput::error(format!(
                        "model '{}' is not available; known models: {}",
                        requested,
                        known.join(", ")
                    ));
                }
            }
            model_id = requested.to_string();
        }

        // The binding captures the parent's working directory as of this
        // call; children never follow a later parent directory change.
        let cwd = ctx.working_dir.to_string_lossy();
        let (child_id, actual_slug) = match ctx.db().resolve_or_create_subagent(
            &ctx.conversation_id,
            &requested_slug,
            &cwd,
            false,
        ) {
            Ok(binding) => binding,
            Err(e) => return ToolOutput::error(e.to_string()),
        };

        tracing::info!(
            parent = %ctx.conversation_id,
            child = %child_id,
            slug = %actual_slug,
            wait,
            timeout_secs,
            model = %model_id,
            "Dispatching to subagent"
        );

        let dispatch = ctx
            .subagent_runner()
            .run(
                ctx.cancel.clone(),
                &child_id,
                &input.prompt,
                wait,
                Duration::from_secs(timeout_secs),
                &model_id,
            )
            .await;

        match dispatch {
            Ok(text) => ToolOutput::success(compose_reply(&requested_slug, &actual_slug, &text))
                .with_display(json!({
                    "slug": actual_slug,
                    "conversation_id": child_id,
                })),
            Err(e) => ToolOutput::error(format!("subagent error: {e}")),
        }
    }
}

/// Frame the child's text as the subagent tool result, noting a slug change
/// when the directory allocated a different slug than the one requested.
fn compose_reply(requested_slug: &str, actual_slug: &str, body: &str) -> String {
    let mut reply = format!("Subagent '{actual_slug}' response:");
    if actual_slug != requested_slug {
        reply.push_str(&format!(
            " (Note: slug was changed to '{actual_slug}' for uniqueness. \
             Use '{actual_slug}' for future messages to this subagent.)"
        ));
    }
    reply.push('\n');
    reply.push_str(body);
    reply
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, LlmRequest, LlmResponse, LlmService};
    use crate::tools::test_support::context_with;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // ==================== Slug sanitization ====================

    #[test]
    fn test_sanitize_table() {
        assert_eq!(sanitize_slug("Test Slug"), "test-slug");
        assert_eq!(sanitize_slug("test_slug"), "test-slug");
        assert_eq!(sanitize_slug("test--slug"), "test-slug");
        assert_eq!(sanitize_slug("-test-slug-"), "test-slug");
        assert_eq!(sanitize_slug("test@slug!"), "testslug");
        assert_eq!(sanitize_slug("123-abc"), "123-abc");
        assert_eq!(sanitize_slug(""), "");
        assert_eq!(sanitize_slug("@#$%"), "");
    }

    #[test]
    fn test_sanitize_mixed_separators() {
        assert_eq!(sanitize_slug("A _ B"), "a-b");
        assert_eq!(sanitize_slug("__x__"), "x");
    }

    proptest! {
        #[test]
        fn prop_sanitize_idempotent(s in ".{0,64}") {
            let once = sanitize_slug(&s);
            prop_assert_eq!(sanitize_slug(&once), once);
        }

        #[test]
        fn prop_sanitize_charset(s in ".{0,64}") {
            let slug = sanitize_slug(&s);
            prop_assert!(slug.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            prop_assert!(!slug.starts_with('-'));
            prop_assert!(!slug.ends_with('-'));
            prop_assert!(!slug.contains("--"));
        }
    }

    // ==================== Test doubles ====================

    struct MockLlm;

    #[async_trait]
    impl LlmService for MockLlm {
        async fn complete(&self, _request: &LlmRequest) -> Result<LlmResponse, LlmError> {
            Err(LlmError::unknown("mock"))
        }

        fn model_id(&self) -> &str {
            "mock"
        }
    }

    fn two_model_registry() -> Arc<ModelRegistry> {
        Arc::new(ModelRegistry::with_services(
            vec![
                ("sonnet", "", Arc::new(MockLlm)),
                ("haiku", "Haiku 4.5", Arc::new(MockLlm)),
            ],
            "sonnet",
        ))
    }

    #[derive(Clone, Debug)]
    struct RecordedCall {
        conversation_id: String,
        prompt: String,
        wait: bool,
        timeout: Duration,
        model_id: String,
    }

    struct RecordingRunner {
        calls: Mutex<Vec<RecordedCall>>,
        reply: Result<String, String>,
    }

    impl RecordingRunner {
        fn ok(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: Ok(reply.to_string()),
            })
        }

        fn err(message: &str) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: Err(message.to_string()),
            })
        }

        fn last_call(&self) -> RecordedCall {
            self.calls.lock().unwrap().last().cloned().unwrap()
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl SubagentRunner for RecordingRunner {
        async fn run(
            &self,
            _cancel: CancellationToken,
            conversation_id: &str,
            prompt: &str,
            wait: bool,
            timeout: Duration,
            model_id: &str,
        ) -> Result<String, String> {
            self.calls.lock().unwrap().push(RecordedCall {
                conversation_id: conversation_id.to_string(),
                prompt: prompt.to_string(),
                wait,
                timeout,
                model_id: model_id.to_string(),
            });
            self.reply.clone()
        }
    }

    // ==================== Descriptor ====================

    #[test]
    fn test_descriptor_empty_registry() {
        let tool = SubagentTool::new(Arc::new(ModelRegistry::new_empty()));

        assert!(!tool.description().contains("Available models"));
        let schema = tool.input_schema();
        assert!(schema["properties"]["model"].is_null());
        assert_eq!(schema["required"], json!(["slug", "prompt"]));
    }

    #[test]
    fn test_descriptor_lists_models_in_order() {
        let tool = SubagentTool::new(two_model_registry());

        let description = tool.description();
        assert!(description.contains("- haiku (Haiku 4.5)"));
        assert!(description.contains("- sonnet"));
        assert!(!description.contains("- sonnet ("));

        let schema = tool.input_schema();
        assert_eq!(schema["properties"]["model"]["enum"], json!(["sonnet", "haiku"]));
    }

    #[test]
    fn test_descriptor_display_name_equal_to_id_is_absent() {
        let registry = Arc::new(ModelRegistry::with_services(
            vec![("sonnet", "sonnet", Arc::new(MockLlm))],
            "sonnet",
        ));
        let tool = SubagentTool::new(registry);
        assert!(tool.description().contains("- sonnet"));
        assert!(!tool.description().contains("- sonnet (sonnet)"));
    }

    // ==================== Validation ====================

    #[tokio::test]
    async fn test_missing_slug() {
        let runner = RecordingRunner::ok("unused");
        let tool = SubagentTool::new(Arc::new(ModelRegistry::new_empty()));
        let ctx = context_with("claude-4.5-sonnet", runner.clone());

        let result = tool.run(json!({"prompt": "Do something"}), ctx).await;
        assert!(!result.success);
        assert!(result.output.contains("slug is required"));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_prompt() {
        let runner = RecordingRunner::ok("unused");
        let tool = SubagentTool::new(Arc::new(ModelRegistry::new_empty()));
        let ctx = context_with("claude-4.5-sonnet", runner.clone());

        let result = tool.run(json!({"slug": "task", "prompt": ""}), ctx).await;
        assert!(!result.success);
        assert!(result.output.contains("prompt is required"));
    }

    #[tokio::test]
    async fn test_slug_with_no_usable_characters() {
        let runner = RecordingRunner::ok("unused");
        let tool = SubagentTool::new(Arc::new(ModelRegistry::new_empty()));
        let ctx = context_with("claude-4.5-sonnet", runner.clone());

        let result = tool
            .run(json!({"slug": "@#$%", "prompt": "Do something"}), ctx)
            .await;
        assert!(!result.success);
        assert!(result.output.contains("must contain alphanumeric characters"));
    }

    #[tokio::test]
    async fn test_malformed_input() {
        let runner = RecordingRunner::ok("unused");
        let tool = SubagentTool::new(Arc::new(ModelRegistry::new_empty()));
        let ctx = context_with("claude-4.5-sonnet", runner.clone());

        let result = tool.run(json!({"slug": 7, "prompt": "x"}), ctx).await;
        assert!(!result.success);
        assert!(result.output.contains("failed to parse subagent input"));
    }

    // ==================== Dispatch ====================

    #[tokio::test]
    async fn test_happy_path_wait_true() {
        let runner = RecordingRunner::ok("Task completed successfully");
        let tool = SubagentTool::new(Arc::new(ModelRegistry::new_empty()));
        let ctx = context_with("claude-4.5-sonnet", runner.clone());
        let db = ctx.db().clone();

        let result = tool
            .run(json!({"slug": "test-task", "prompt": "Do something"}), ctx)
            .await;

        assert!(result.success);
        assert!(result.output.starts_with("Subagent 'test-task' response:\n"));
        assert!(result.output.ends_with("Task completed successfully"));

        let call = runner.last_call();
        assert_eq!(call.prompt, "Do something");
        assert!(call.wait);
        assert_eq!(call.timeout, Duration::from_secs(60));
        assert_eq!(call.model_id, "claude-4.5-sonnet");

        // Display payload links the UI to the allocated child conversation
        let display = result.display_data.unwrap();
        assert_eq!(display["slug"], "test-task");
        assert_eq!(display["conversation_id"], call.conversation_id.as_str());

        let child = db.get_conversation(&call.conversation_id).unwrap();
        assert_eq!(child.slug.as_deref(), Some("test-task"));
        assert_eq!(child.parent_conversation_id.as_deref(), Some("parent-conv"));
    }

    #[tokio::test]
    async fn test_slug_is_sanitized_before_binding() {
        let runner = RecordingRunner::ok("ok");
        let tool = SubagentTool::new(Arc::new(ModelRegistry::new_empty()));
        let ctx = context_with("claude-4.5-sonnet", runner.clone());
        let db = ctx.db().clone();

        let result = tool
            .run(json!({"slug": "Test Slug", "prompt": "go"}), ctx)
            .await;

        assert!(result.success);
        assert!(result.output.starts_with("Subagent 'test-slug' response:"));
        // Sanitized slug matches what was bound, so no change notice
        assert!(!result.output.contains("Note: slug was changed"));

        let children = db.list_subagents("parent-conv").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].slug.as_deref(), Some("test-slug"));
    }

    #[tokio::test]
    async fn test_same_slug_reuses_child() {
        let runner = RecordingRunner::ok("ok");
        let tool = SubagentTool::new(Arc::new(ModelRegistry::new_empty()));
        let ctx = context_with("claude-4.5-sonnet", runner.clone());

        let first = tool
            .run(json!({"slug": "worker", "prompt": "one"}), ctx.clone())
            .await;
        let second = tool
            .run(json!({"slug": "worker", "prompt": "two"}), ctx)
            .await;

        let id1 = first.display_data.unwrap()["conversation_id"].clone();
        let id2 = second.display_data.unwrap()["conversation_id"].clone();
        assert_eq!(id1, id2);
    }

    #[tokio::test]
    async fn test_model_inherited_from_parent() {
        let runner = RecordingRunner::ok("ok");
        let tool = SubagentTool::new(Arc::new(ModelRegistry::new_empty()));
        let ctx = context_with("sonnet-4", runner.clone());

        let result = tool.run(json!({"slug": "t", "prompt": "go"}), ctx).await;
        assert!(result.success);
        assert_eq!(runner.last_call().model_id, "sonnet-4");
    }

    #[tokio::test]
    async fn test_model_override_valid() {
        let runner = RecordingRunner::ok("ok");
        let tool = SubagentTool::new(two_model_registry());
        let ctx = context_with("sonnet", runner.clone());

        let result = tool
            .run(json!({"slug": "t", "prompt": "go", "model": "haiku"}), ctx)
            .await;
        assert!(result.success);
        assert_eq!(runner.last_call().model_id, "haiku");
    }

    #[tokio::test]
    async fn test_model_override_invalid() {
        let runner = RecordingRunner::ok("unused");
        let tool = SubagentTool::new(two_model_registry());
        let ctx = context_with("sonnet", runner.clone());

        let result = tool
            .run(
                json!({"slug": "t", "prompt": "go", "model": "nonexistent"}),
                ctx,
            )
            .await;
        assert!(!result.success);
        assert!(result.output.contains("nonexistent"));
        assert!(result.output.contains("sonnet"));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_clamped_to_maximum() {
        let runner = RecordingRunner::ok("ok");
        let tool = SubagentTool::new(Arc::new(ModelRegistry::new_empty()));
        let ctx = context_with("claude-4.5-sonnet", runner.clone());

        let result = tool
            .run(
                json!({"slug": "t", "prompt": "go", "timeout_seconds": 9999}),
                ctx,
            )
            .await;
        assert!(result.success);
        assert_eq!(runner.last_call().timeout, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_nonpositive_timeout_uses_default() {
        let runner = RecordingRunner::ok("ok");
        let tool = SubagentTool::new(Arc::new(ModelRegistry::new_empty()));
        let ctx = context_with("claude-4.5-sonnet", runner.clone());

        let result = tool
            .run(
                json!({"slug": "t", "prompt": "go", "timeout_seconds": -5}),
                ctx,
            )
            .await;
        assert!(result.success);
        assert_eq!(runner.last_call().timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_wait_false_is_passed_through() {
        let runner = RecordingRunner::ok("Prompt delivered; subagent is working in the background.");
        let tool = SubagentTool::new(Arc::new(ModelRegistry::new_empty()));
        let ctx = context_with("claude-4.5-sonnet", runner.clone());

        let result = tool
            .run(json!({"slug": "t", "prompt": "go", "wait": false}), ctx)
            .await;
        assert!(result.success);
        assert!(!runner.last_call().wait);
        assert!(result.output.contains("working in the background"));
    }

    #[tokio::test]
    async fn test_runner_error_is_prefixed() {
        let runner = RecordingRunner::err("cancelled while waiting for subagent");
        let tool = SubagentTool::new(Arc::new(ModelRegistry::new_empty()));
        let ctx = context_with("claude-4.5-sonnet", runner.clone());

        let result = tool.run(json!({"slug": "t", "prompt": "go"}), ctx).await;
        assert!(!result.success);
        assert!(result.output.starts_with("subagent error: "));
        assert!(result.output.contains("cancelled"));
    }

    // ==================== Reply framing ====================

    #[test]
    fn test_compose_reply_plain() {
        let reply = compose_reply("foo", "foo", "all done");
        assert_eq!(reply, "Subagent 'foo' response:\nall done");
    }

    #[test]
    fn test_compose_reply_with_slug_change_notice() {
        let reply = compose_reply("foo", "foo-3", "all done");
        assert!(reply.starts_with("Subagent 'foo-3' response: (Note: slug was changed to 'foo-3'"));
        assert!(reply.contains("Use 'foo-3' for future messages"));
        assert!(reply.ends_with("\nall done"));
    }

    #[test]
    fn test_compose_reply_empty_body() {
        let reply = compose_reply("foo", "foo", "");
        assert_eq!(reply, "Subagent 'foo' response:\n");
    }
}
