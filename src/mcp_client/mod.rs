//! MCP Client: remote tool servers over streamable HTTP.
//!
//! This module handles:
//! - JSON-RPC 2.0 over HTTP (plain JSON or SSE responses)
//! - The configured server list and each server's connection state
//! - The connected-server fingerprint that drives agent rebuilds
//! - Binding connected servers into one flat, namespaced tool set
//!
//! The registry owns connections used for status; the binder opens its own
//! connections per agent generation and releases them through one handle.

pub mod binder;
pub mod errors;
pub mod fingerprint;
pub mod lifecycle;
pub mod registry;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use binder::{BoundTool, BoundTools, McpToolBinder, ReleaseHandle, ToolBinder};
pub use errors::McpError;
pub use fingerprint::{Fingerprint, ServerConfig};
pub use registry::{
    ConnectionState, RegistrySettings, ServerEntry, ServerId, ServerRegistry, StoredServer,
};
pub use transport::{Connection, HttpTransport, Transport};
pub use types::{CallToolResult, McpToolDefinition, ToolCallResult};
