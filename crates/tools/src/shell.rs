//! Shell execution: the registered `shell` tool and the runner behind
//! `shell:` script targets.
//!
//! Foreground only — a deterministic cell owns its tool for the duration
//! of the phase. Output is capped and stdout is decoded as JSON when it
//! parses, so scripts can hand structured rows back to the cascade.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use casc_domain::error::{Error, Result};

use crate::tool::{Tool, ToolContext};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MAX_OUTPUT_CHARS: usize = 200_000;

/// Check if an environment variable name is dangerous to override.
fn is_dangerous_env_var(name: &str) -> bool {
    const BLOCKED: &[&str] = &[
        "LD_PRELOAD",
        "LD_LIBRARY_PATH",
        "DYLD_INSERT_LIBRARIES",
        "PATH",
        "HOME",
        "SHELL",
        "BASH_ENV",
        "ENV",
        "IFS",
    ];
    BLOCKED.contains(&name.to_ascii_uppercase().as_str())
}

fn cap_output(mut text: String) -> String {
    if text.len() > MAX_OUTPUT_CHARS {
        let mut end = MAX_OUTPUT_CHARS;
        while !text.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("\n[TRUNCATED]");
    }
    text
}

async fn run(
    mut cmd: Command,
    stdin_payload: Option<String>,
    timeout: Duration,
) -> Result<Value> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Tool {
            tool: "shell".into(),
            message: format!("spawn failed: {e}"),
        })?;

    if let Some(payload) = stdin_payload {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(payload.as_bytes()).await;
        }
    } else {
        drop(child.stdin.take());
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| Error::Timeout(format!("shell command exceeded {}s", timeout.as_secs())))?
        .map_err(|e| Error::Tool {
            tool: "shell".into(),
            message: format!("wait failed: {e}"),
        })?;

    let stdout = cap_output(String::from_utf8_lossy(&output.stdout).into_owned());
    let stderr = cap_output(String::from_utf8_lossy(&output.stderr).into_owned());
    let exit_code = output.status.code().unwrap_or(-1);

    if !output.status.success() {
        return Ok(json!({
            "_route": "error",
            "error": if stderr.trim().is_empty() { format!("exit code {exit_code}") } else { stderr.trim().to_string() },
            "exit_code": exit_code,
            "stdout": stdout,
        }));
    }

    // Structured scripts print JSON; anything else is wrapped.
    match serde_json::from_str::<Value>(stdout.trim()) {
        Ok(parsed) if parsed.is_object() || parsed.is_array() => Ok(parsed),
        _ => Ok(json!({"stdout": stdout, "exit_code": exit_code})),
    }
}

/// Run a `shell:` script target. Rendered cell inputs arrive both as
/// `CASC_INPUT_<KEY>` environment variables and as a JSON object on stdin.
pub async fn run_script(path: &Path, inputs: &Map<String, Value>) -> Result<Value> {
    if !path.exists() {
        return Err(Error::Tool {
            tool: "shell".into(),
            message: format!("script not found: {}", path.display()),
        });
    }
    let mut cmd = Command::new("sh");
    cmd.arg(path);
    for (key, value) in inputs {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        cmd.env(format!("CASC_INPUT_{}", key.to_ascii_uppercase()), text);
    }
    let stdin = serde_json::to_string(&Value::Object(inputs.clone()))?;
    run(cmd, Some(stdin), DEFAULT_TIMEOUT).await
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registered tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The registered `shell` tool: run one command via `sh -c`.
pub struct ShellTool {
    timeout: Duration,
}

impl ShellTool {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for ShellTool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Run a shell command and return its output. Structured JSON on stdout is decoded."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Command line passed to sh -c"},
                "workdir": {"type": "string"},
                "env": {"type": "object", "additionalProperties": {"type": "string"}}
            },
            "required": ["command"]
        })
    }

    async fn invoke(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Tool {
                tool: "shell".into(),
                message: "missing required argument: command".into(),
            })?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        if let Some(workdir) = args.get("workdir").and_then(Value::as_str) {
            cmd.current_dir(workdir);
        }
        if let Some(env) = args.get("env").and_then(Value::as_object) {
            let env: HashMap<&String, &Value> = env.iter().collect();
            for (key, value) in env {
                if is_dangerous_env_var(key) {
                    return Err(Error::Tool {
                        tool: "shell".into(),
                        message: format!("environment variable {key} is blocked"),
                    });
                }
                if let Some(text) = value.as_str() {
                    cmd.env(key, text);
                }
            }
        }
        run(cmd, None, self.timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_output_wrapped() {
        let tool = ShellTool::new();
        let ctx = ToolContext::new("s1", "cell", json!({}));
        let out = tool
            .invoke(json!({"command": "printf hello"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["stdout"], json!("hello"));
        assert_eq!(out["exit_code"], json!(0));
    }

    #[tokio::test]
    async fn json_stdout_is_decoded() {
        let tool = ShellTool::new();
        let ctx = ToolContext::new("s1", "cell", json!({}));
        let out = tool
            .invoke(
                json!({"command": "printf '{\"rows\": [{\"n\": 1}]}'"}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out["rows"][0]["n"], json!(1));
    }

    #[tokio::test]
    async fn failure_becomes_error_route() {
        let tool = ShellTool::new();
        let ctx = ToolContext::new("s1", "cell", json!({}));
        let out = tool
            .invoke(json!({"command": "exit 3"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["_route"], json!("error"));
        assert_eq!(out["exit_code"], json!(3));
    }

    #[tokio::test]
    async fn blocked_env_rejected() {
        let tool = ShellTool::new();
        let ctx = ToolContext::new("s1", "cell", json!({}));
        let result = tool
            .invoke(json!({"command": "true", "env": {"PATH": "/tmp"}}), &ctx)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn script_target_gets_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("echo_input.sh");
        std::fs::write(&script, "printf '{\"seen\": \"'$CASC_INPUT_QUERY'\"}'").unwrap();

        let mut inputs = Map::new();
        inputs.insert("query".into(), json!("hello"));
        let out = run_script(&script, &inputs).await.unwrap();
        assert_eq!(out["seen"], json!("hello"));
    }
}
