//! One MCP server connection over child-process stdio.

use crate::protocol::{
    Notification, Request, Response, ToolCallResult, ToolsListResult, McpTool, PROTOCOL_VERSION,
};
use serde_json::json;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use switchboard_core::config::McpServerConfig;
use switchboard_core::error::HostError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A live connection to one MCP server subprocess.
pub struct McpConnection {
    name: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    next_id: AtomicI64,
    tools: Vec<McpTool>,
}

impl McpConnection {
    /// Spawn the configured command and perform the MCP handshake
    /// (`initialize` → `notifications/initialized` → `tools/list`).
    pub async fn connect(name: &str, config: &McpServerConfig) -> Result<Self, HostError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| HostError::Tool(format!("mcp {name}: failed to spawn: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::Tool(format!("mcp {name}: no stdin pipe")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Tool(format!("mcp {name}: no stdout pipe")))?;

        let mut conn = Self {
            name: name.to_string(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            next_id: AtomicI64::new(1),
            tools: Vec::new(),
        };

        conn.request(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "switchboard", "version": env!("CARGO_PKG_VERSION")},
            })),
        )
        .await?;
        conn.notify("notifications/initialized").await?;

        let listed = conn.request("tools/list", None).await?;
        let result: ToolsListResult = serde_json::from_value(listed)
            .map_err(|e| HostError::Tool(format!("mcp {name}: bad tools/list result: {e}")))?;
        debug!("mcp {name}: {} tools", result.tools.len());
        conn.tools = result.tools;

        Ok(conn)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tools(&self) -> &[McpTool] {
        &self.tools
    }

    /// Call one tool and return its flattened text content.
    pub async fn call_tool(
        &self,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Result<String, HostError> {
        let result = self
            .request(
                "tools/call",
                Some(json!({"name": tool, "arguments": arguments})),
            )
            .await?;
        let parsed: ToolCallResult = serde_json::from_value(result).map_err(|e| {
            HostError::Tool(format!("mcp {}: bad tools/call result: {e}", self.name))
        })?;
        if parsed.is_error {
            return Err(HostError::Tool(format!(
                "mcp {}: tool {tool} failed: {}",
                self.name,
                parsed.flattened_text()
            )));
        }
        Ok(parsed.flattened_text())
    }

    /// Send a request line and read lines until the matching response id,
    /// skipping server-initiated notifications.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, HostError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = Request::new(id, method, params);
        let mut line = serde_json::to_string(&req)?;
        line.push('\n');

        tokio::time::timeout(REQUEST_TIMEOUT, async {
            {
                let mut stdin = self.stdin.lock().await;
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await?;
            }
            let mut stdout = self.stdout.lock().await;
            loop {
                let mut buf = String::new();
                let read = stdout.read_line(&mut buf).await?;
                if read == 0 {
                    return Err(HostError::Tool(format!(
                        "mcp {}: server closed stdout",
                        self.name
                    )));
                }
                let trimmed = buf.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let resp: Response = match serde_json::from_str(trimmed) {
                    Ok(r) => r,
                    Err(_) => {
                        // Notifications and log noise are skipped.
                        continue;
                    }
                };
                if resp.id != Some(id) {
                    continue;
                }
                if let Some(err) = resp.error {
                    return Err(HostError::Tool(format!(
                        "mcp {}: {method} failed ({}): {}",
                        self.name, err.code, err.message
                    )));
                }
                return Ok(resp.result.unwrap_or(serde_json::Value::Null));
            }
        })
        .await
        .map_err(|_| {
            HostError::Tool(format!(
                "mcp {}: {method} timed out after {}s",
                self.name,
                REQUEST_TIMEOUT.as_secs()
            ))
        })?
    }

    async fn notify(&self, method: &str) -> Result<(), HostError> {
        let note = Notification::new(method);
        let mut line = serde_json::to_string(&note)?;
        line.push('\n');
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close the transport and reap the child.
    pub async fn close(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            warn!("mcp {}: kill failed: {e}", self.name);
        }
    }
}
