//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// Opening a transport to the server failed.
    #[error("failed to connect to '{endpoint}': {reason}")]
    ConnectFailed { endpoint: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{endpoint}' initialization failed: {reason}")]
    InitFailed { endpoint: String, reason: String },

    /// HTTP or JSON-RPC framing error (malformed message, I/O error).
    #[error("transport error for '{endpoint}': {reason}")]
    TransportError { endpoint: String, reason: String },

    /// Non-2xx HTTP response from the server.
    #[error("HTTP {status} from '{endpoint}'")]
    HttpError { endpoint: String, status: u16 },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Tool not found among the bound tools.
    #[error("unknown tool: '{name}'")]
    UnknownTool { name: String },

    /// A request did not complete within its timeout.
    #[error("'{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The connection was already closed.
    #[error("connection to '{endpoint}' is closed")]
    Closed { endpoint: String },

    /// Tool discovery failed for one server of a bind.
    #[error("tool discovery failed for server '{server}': {reason}")]
    DiscoveryFailed { server: String, reason: String },

    /// Configuration error (bad endpoint, empty name).
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl McpError {
    /// Short human-readable reason, used for per-entry status details.
    pub fn reason(&self) -> String {
        match self {
            McpError::ConnectFailed { reason, .. }
            | McpError::InitFailed { reason, .. }
            | McpError::TransportError { reason, .. }
            | McpError::DiscoveryFailed { reason, .. }
            | McpError::ConfigError { reason } => reason.clone(),
            other => other.to_string(),
        }
    }
}
