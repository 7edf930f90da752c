//! Assembly and execution of one agent CLI invocation: argument vector,
//! environment, prompt, and the single-shot run path.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tracing::warn;

use crate::error::GatewayErr;
use crate::error::Result;
use crate::protocol::AgentMessage;
use crate::protocol::Role;
use crate::protocol::text_envelope;

/// Alias table for the agent's model names; unknown names pass through
/// unchanged so callers can pin concrete model ids.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("opus", "claude-opus-4-20250514"),
    ("sonnet", "claude-sonnet-4-5-20250929"),
    ("haiku", "claude-3-5-haiku-20241022"),
];

pub fn resolve_model(model: &str) -> &str {
    MODEL_ALIASES
        .iter()
        .find(|(alias, _)| *alias == model)
        .map(|(_, id)| *id)
        .unwrap_or(model)
}

/// Everything needed to assemble one agent invocation. Built by the
/// dispatcher once per request and shared by all execution modes.
#[derive(Debug, Clone)]
pub struct InvocationSpec {
    pub agent_bin: PathBuf,
    pub workspace: PathBuf,
    pub model: String,
    /// Session to resume; only set when the session-existence check passed.
    pub resume_session: Option<String>,
    pub settings_json: String,
    pub mcp_config_json: Option<String>,
}

impl InvocationSpec {
    /// Flag portion of the argument vector, shared by all execution modes.
    fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "--print".to_string(),
            "--model".to_string(),
            resolve_model(&self.model).to_string(),
        ];
        if let Some(session) = &self.resume_session {
            args.push("--resume".to_string());
            args.push(session.clone());
        }
        if self.mcp_config_json.is_some() {
            // MCP tool prompts cannot be answered over --print.
            args.push("--dangerously-skip-permissions".to_string());
        }
        args.push("--settings".to_string());
        args.push(self.settings_json.clone());
        if let Some(mcp_config) = &self.mcp_config_json {
            args.push("--mcp-config".to_string());
            args.push(mcp_config.clone());
        }
        args
    }

    /// Argument vector for a single-shot run: flags, then the prompt.
    pub fn single_shot_args(&self, messages: &[AgentMessage]) -> Vec<String> {
        let mut args = self.base_args();
        if self.mcp_config_json.is_some() {
            // A `-`-leading prompt must not be parsed as a flag.
            args.push("--".to_string());
        }
        args.push(assemble_prompt(messages));
        args
    }

    /// Argument vector for stream-json execution (pooled and dedicated
    /// streams alike).
    pub fn streaming_args(&self) -> Vec<String> {
        let mut args = self.base_args();
        args.extend(
            [
                "--input-format",
                "stream-json",
                "--output-format",
                "stream-json",
                "--include-partial-messages",
                "--verbose",
            ]
            .iter()
            .map(|s| (*s).to_string()),
        );
        args
    }

    /// Minimal environment: the workspace doubles as HOME and PWD, temp
    /// files stay inside the workspace, and only PATH is inherited.
    pub fn env(&self) -> HashMap<String, String> {
        let workspace = self.workspace.display().to_string();
        HashMap::from([
            ("HOME".to_string(), workspace.clone()),
            ("PWD".to_string(), workspace.clone()),
            (
                "TMPDIR".to_string(),
                self.workspace
                    .join(crate::workspace::SCRATCH_DIR)
                    .display()
                    .to_string(),
            ),
            (
                "PATH".to_string(),
                std::env::var("PATH").unwrap_or_else(|_| "/usr/bin:/bin".to_string()),
            ),
        ])
    }

    /// A ready-to-spawn command with the workspace as working directory and
    /// the scrubbed environment applied.
    pub fn command(&self, args: Vec<String>, stdin: Stdio) -> Command {
        let mut cmd = Command::new(&self.agent_bin);
        cmd.args(args)
            .current_dir(&self.workspace)
            .env_clear()
            .envs(self.env())
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// Blank-line-joined prompt. Non-user roles keep a role prefix so the
/// agent can tell who said what in replayed history.
pub fn assemble_prompt(messages: &[AgentMessage]) -> String {
    let parts: Vec<String> = messages
        .iter()
        .map(|message| match message.role {
            Role::User => message.content.clone(),
            Role::Assistant => format!("Assistant: {}", message.content),
            Role::System => format!("System: {}", message.content),
        })
        .collect();
    parts.join("\n\n")
}

/// Whether the agent has persisted state for `session_id` under the user's
/// credentials directory. This is a substring scan over the top-level
/// files there: the agent embeds the identifier in its session files, and
/// passing `--resume` for an unknown session makes it abort.
pub fn session_exists(claude_dir: &Path, session_id: &str) -> bool {
    let Ok(entries) = fs::read_dir(claude_dir) else {
        return false;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Ok(content) = fs::read_to_string(&path) {
            if content.contains(session_id) {
                return true;
            }
        }
    }
    false
}

/// Spawns the agent once, waits for it under `timeout` and captures its
/// output. Non-JSON stdout is wrapped into a synthetic text envelope.
pub async fn run_single_shot(
    spec: &InvocationSpec,
    messages: &[AgentMessage],
    timeout: Duration,
) -> Result<Value> {
    let args = spec.single_shot_args(messages);
    let child = spec.command(args, Stdio::null()).spawn()?;

    // On expiry the future owning the child is dropped and kill_on_drop
    // reaps it.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => return Err(GatewayErr::Timeout),
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    if !stderr.trim().is_empty() {
        warn!(
            "agent stderr: {}",
            stderr.chars().take(500).collect::<String>()
        );
    }

    if !output.status.success() {
        let code = output.status.code().unwrap_or(-1);
        let message = if stderr.trim().is_empty() {
            stdout.trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(GatewayErr::AgentExit {
            code,
            stderr: message,
        });
    }

    match serde_json::from_str::<Value>(&stdout) {
        Ok(envelope) => Ok(envelope),
        Err(_) => Ok(text_envelope(stdout.trim(), &spec.model)),
    }
}
