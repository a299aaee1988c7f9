//! # switchboard-mcp
//!
//! Client manager for MCP (Model Context Protocol) tool servers. Each
//! configured server is launched as a child process speaking newline-delimited
//! JSON-RPC 2.0 over stdio; its tools are cached under the namespaced name
//! `<server>__<tool>`.

pub mod client;
pub mod protocol;

use client::McpConnection;
use std::collections::HashMap;
use switchboard_core::chat::ToolDefinition;
use switchboard_core::config::McpConfig;
use switchboard_core::error::HostError;
use tracing::{info, warn};

/// Owns every MCP connection, keyed by server name.
pub struct McpClientManager {
    connections: HashMap<String, McpConnection>,
}

impl Default for McpClientManager {
    fn default() -> Self {
        Self::new()
    }
}

impl McpClientManager {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Launch and handshake every configured server. A server that fails to
    /// start is logged and skipped; the host runs with the tools it has.
    pub async fn connect_all(config: &McpConfig) -> Self {
        let mut connections = HashMap::new();
        for (name, server) in &config.servers {
            match McpConnection::connect(name, server).await {
                Ok(conn) => {
                    info!("mcp: connected {name} ({} tools)", conn.tools().len());
                    connections.insert(name.clone(), conn);
                }
                Err(e) => warn!("mcp: {name} unavailable: {e}"),
            }
        }
        Self { connections }
    }

    /// The union of every server's tools, namespaced `<server>__<tool>`.
    pub fn all_tools(&self) -> Vec<ToolDefinition> {
        let mut out = Vec::new();
        for (server, conn) in &self.connections {
            for tool in conn.tools() {
                out.push(ToolDefinition {
                    name: format!("{server}__{}", tool.name),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Invoke a namespaced tool. Splits on the first `__`; a malformed name
    /// or unknown server fails with a tool error.
    pub async fn invoke_tool(
        &self,
        namespaced: &str,
        arguments: serde_json::Value,
    ) -> Result<String, HostError> {
        let (server, tool) = namespaced
            .split_once("__")
            .ok_or_else(|| HostError::Tool(format!("unknown tool: {namespaced}")))?;
        let conn = self
            .connections
            .get(server)
            .ok_or_else(|| HostError::Tool(format!("unknown tool: {namespaced}")))?;
        conn.call_tool(tool, arguments).await
    }

    /// Close every transport; errors are logged per server.
    pub async fn disconnect_all(&self) {
        for (name, conn) in &self.connections {
            info!("mcp: disconnecting {name}");
            conn.close().await;
        }
    }

    pub fn server_count(&self) -> usize {
        self.connections.len()
    }
}
