//! Bash tool: executes shell commands in the conversation's working directory

use super::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const MAX_OUTPUT_LENGTH: usize = 128 * 1024;
const SNIP_SIZE: usize = 4 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const SLOW_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Execution mode for bash commands
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
enum ExecutionMode {
    #[default]
    Default,
    Slow,
}

impl ExecutionMode {
    fn timeout(self) -> Duration {
        match self {
            ExecutionMode::Default => DEFAULT_TIMEOUT,
            ExecutionMode::Slow => SLOW_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct BashInput {
    command: String,
    #[serde(default)]
    mode: ExecutionMode,
}

pub struct BashTool;

impl BashTool {
    async fn execute(command: &str, mode: ExecutionMode, ctx: &ToolContext) -> ToolOutput {
        let mut cmd = Command::new("bash");
        cmd.args(["-c", command])
            .current_dir(&ctx.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // New process group so timeout/cancel can kill the whole tree
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setpgid(nix::unistd::Pid::from_raw(0), nix::unistd::Pid::from_raw(0))
                    .ok();
                Ok(())
            });
        }

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolOutput::error(format!("Failed to spawn process: {e}")),
        };
        let pid = child.id();

        let timeout = mode.timeout();
        tokio::select! {
            output = child.wait_with_output() => match output {
                Ok(output) => {
                    let stdout = String::from_utf8_lossy(&output.stdout);
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    let combined = format!("{stdout}{stderr}");
                    let formatted = Self::truncate_output(&combined);

                    if output.status.success() {
                        ToolOutput::success(formatted)
                    } else {
                        let exit_code = output.status.code().unwrap_or(-1);
                        ToolOutput::error(format!("[command failed: exit code {exit_code}]\n{formatted}"))
                    }
                }
                Err(e) => ToolOutput::error(format!("Command execution failed: {e}")),
            },
            () = tokio::time::sleep(timeout) => {
                Self::kill_process_group(pid);
                ToolOutput::error(format!("[command timed out after {timeout:?}]"))
            }
            () = ctx.cancel.cancelled() => {
                Self::kill_process_group(pid);
                ToolOutput::error("[command cancelled]")
            }
        }
    }

    fn kill_process_group(pid: Option<u32>) {
        #[cfg(unix)]
        if let Some(pid) = pid {
            use nix::sys::signal::{killpg, Signal};
            use nix::unistd::Pid;
            let _ = killpg(Pid::from_raw(pid.cast_signed()), Signal::SIGKILL);
        }
        #[cfg(not(unix))]
        let _ = pid;
    }

    fn truncate_output(output: &str) -> String {
        if output.len() <= MAX_OUTPUT_LENGTH {
            return output.to_string();
        }

        let start: String = output.chars().take(SNIP_SIZE).collect();
        let end_len = output.chars().count().saturating_sub(SNIP_SIZE);
        let end: String = output.chars().skip(end_len).collect();

        format!(
            "[output truncated in middle: got {} bytes, max is {} bytes]\n{}\n\n[snip]\n\n{}",
            output.len(),
            MAX_OUTPUT_LENGTH,
            start,
            end
        )
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn description(&self) -> String {
        r#"Executes a shell command via bash -c in the conversation's working directory, returning combined stdout/stderr.
Bash state (variables, aliases, cd) does not persist between calls.

Use mode="slow" for potentially slow commands: builds, downloads, installs, tests.

Keep commands concise. For complex scripts, write them to a file first and execute the file."#
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["command"],
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to execute via bash -c"
                },
                "mode": {
                    "type": "string",
                    "enum": ["default", "slow"],
                    "description": "Execution mode: default (30s timeout) or slow (15min timeout)"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: BashInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        if input.command.is_empty() {
            return ToolOutput::error("Command cannot be empty");
        }

        Self::execute(&input.command, input.mode, &ctx).await
    }
}
