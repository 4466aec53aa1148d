//! Think tool: lets the LLM reason out loud without side effects

use super::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

pub struct ThinkTool;

#[derive(Debug, Deserialize)]
struct ThinkInput {
    #[allow(dead_code)] // Deserialized for validation only
    thoughts: String,
}

#[async_trait]
impl Tool for ThinkTool {
    fn name(&self) -> &'static str {
        "think"
    }

    fn description(&self) -> String {
        "Work through a problem before acting: plan multi-step changes, debug a surprising result, or weigh alternatives. Free-form, no side effects."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["thoughts"],
            "properties": {
                "thoughts": {
                    "type": "string",
                    "description": "The thoughts, notes, or plans to record"
                }
            }
        })
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> ToolOutput {
        match serde_json::from_value::<ThinkInput>(input) {
            Ok(_) => ToolOutput::success("recorded"),
            Err(e) => ToolOutput::error(format!("Invalid input: {e}")),
        }
    }
}
