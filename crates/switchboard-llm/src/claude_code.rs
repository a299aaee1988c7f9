//! Claude Code CLI subprocess backend (completion-only).
//!
//! Runs `claude -p <prompt> --output-format json` and parses the JSON result
//! from stdout. Wrapped by [`crate::adapter::CompletionAdapter`] for chat and
//! tool use.

use crate::CompletionBackend;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use switchboard_core::error::HostError;
use tokio::process::Command;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// CLI subprocess backend.
pub struct ClaudeCodeBackend {
    model: String,
    timeout: Duration,
}

/// Shape of `claude --output-format json` stdout.
#[derive(Debug, Deserialize)]
struct CliResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    subtype: Option<String>,
}

impl ClaudeCodeBackend {
    pub fn new(model: String) -> Self {
        Self {
            model,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Probe whether the `claude` CLI is installed and responding.
    pub async fn check_cli() -> bool {
        Command::new("claude")
            .arg("--version")
            .output()
            .await
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn parse_stdout(&self, stdout: &str) -> Result<(String, Option<String>), HostError> {
        let parsed: CliResponse = serde_json::from_str(stdout)
            .map_err(|e| HostError::Llm(format!("claude CLI: unparseable output: {e}")))?;
        if parsed.is_error {
            return Err(HostError::Llm(format!(
                "claude CLI reported error ({})",
                parsed.subtype.as_deref().unwrap_or("unknown")
            )));
        }
        let text = parsed.result.unwrap_or_default();
        let model = parsed.model.or_else(|| {
            if self.model.is_empty() {
                None
            } else {
                Some(self.model.clone())
            }
        });
        Ok((text, model))
    }
}

#[async_trait]
impl CompletionBackend for ClaudeCodeBackend {
    fn name(&self) -> &str {
        "claude-code"
    }

    async fn complete(&self, prompt: &str) -> Result<(String, Option<String>), HostError> {
        let mut cmd = Command::new("claude");
        cmd.arg("-p")
            .arg(prompt)
            .arg("--output-format")
            .arg("json")
            .arg("--max-turns")
            .arg("1");
        if !self.model.is_empty() {
            cmd.arg("--model").arg(&self.model);
        }
        // The CLI refuses to run when it believes it is nested.
        cmd.env_remove("CLAUDECODE");

        debug!("claude-code: claude -p <prompt> --output-format json");

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                HostError::Llm(format!(
                    "claude CLI timed out after {}s",
                    self.timeout.as_secs()
                ))
            })?
            .map_err(|e| HostError::Llm(format!("failed to run claude CLI: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(HostError::Llm(format!(
                "claude CLI exited with {}: {stderr}",
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        self.parse_stdout(&stdout)
    }

    async fn is_available(&self) -> bool {
        Self::check_cli().await
    }
}
