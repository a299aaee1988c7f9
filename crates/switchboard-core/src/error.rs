use thiserror::Error;

/// Top-level error type for the host.
#[derive(Debug, Error)]
pub enum HostError {
    /// Error from a messaging channel (connect, send).
    #[error("channel error: {0}")]
    Channel(String),

    /// Error from an LLM backend.
    #[error("llm error: {0}")]
    Llm(String),

    /// Error from an MCP server or an unknown tool name.
    #[error("tool error: {0}")]
    Tool(String),

    /// Storage error (history, journal, task store).
    #[error("storage error: {0}")]
    Storage(String),

    /// Configuration error, fatal at startup.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
