//! Tool binding: turns a fingerprint into invocable tools.
//!
//! For every server in the fingerprint a dedicated connection is opened and
//! its tools discovered. Tools are namespaced `<server>__<tool>` so two
//! servers exposing the same tool name never collide. Everything opened for
//! one bind is torn down through a single idempotent [`ReleaseHandle`].
//!
//! Binding is all-or-nothing: if any server fails, the connections opened so
//! far are closed and the whole bind fails.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::errors::McpError;
use super::fingerprint::Fingerprint;
use super::lifecycle::open_connection;
use super::transport::{Connection, Transport};
use super::types::{CallToolResult, McpToolDefinition};
use crate::inference::types::Provider;

// ─── Constants ───────────────────────────────────────────────────────────────

/// Separator between server and tool in a bound tool name.
pub const NAME_SEPARATOR: &str = "__";

/// Longest function name every provider accepts.
const MAX_TOOL_NAME_LEN: usize = 64;

// ─── Bound Tools ─────────────────────────────────────────────────────────────

/// One invocable tool, tied to the connection it was discovered on.
#[derive(Clone)]
pub struct BoundTool {
    /// Namespaced name presented to the model.
    pub name: String,
    /// Originating server name.
    pub server: String,
    pub description: String,
    /// JSON schema of the arguments, adapted for the selected provider.
    pub parameters: serde_json::Value,
    remote_name: String,
    connection: Arc<dyn Connection>,
}

impl BoundTool {
    pub fn new(
        server: &str,
        definition: McpToolDefinition,
        provider: Provider,
        connection: Arc<dyn Connection>,
    ) -> Self {
        Self {
            name: tool_name(server, &definition.name),
            server: server.to_string(),
            description: definition.description.unwrap_or_default(),
            parameters: adapt_schema(definition.input_schema, provider),
            remote_name: definition.name,
            connection,
        }
    }

    /// The tool's name on its own server.
    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    /// Invoke the tool on its server.
    pub async fn call(&self, arguments: serde_json::Value) -> Result<CallToolResult, McpError> {
        self.connection.invoke(&self.remote_name, arguments).await
    }
}

impl std::fmt::Debug for BoundTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundTool")
            .field("name", &self.name)
            .field("server", &self.server)
            .finish()
    }
}

/// Result of a bind: the flat tool list plus its release handle.
pub struct BoundTools {
    pub tools: Vec<BoundTool>,
    pub release: ReleaseHandle,
}

// ─── Release Handle ──────────────────────────────────────────────────────────

struct ReleaseInner {
    released: AtomicBool,
    connections: Mutex<Vec<Arc<dyn Connection>>>,
}

impl Drop for ReleaseInner {
    fn drop(&mut self) {
        if !self.released.load(Ordering::Acquire) {
            let leaked = self.connections.get_mut().map(|c| c.len()).unwrap_or(0);
            if leaked > 0 {
                tracing::warn!(connections = leaked, "tool bind dropped without release");
            }
        }
    }
}

/// Idempotent teardown of every connection one bind opened.
///
/// Clones share state: the first `release` closes everything, later calls
/// (on any clone) do nothing.
#[derive(Clone)]
pub struct ReleaseHandle {
    inner: Arc<ReleaseInner>,
}

impl ReleaseHandle {
    pub fn new(connections: Vec<Arc<dyn Connection>>) -> Self {
        Self {
            inner: Arc::new(ReleaseInner {
                released: AtomicBool::new(false),
                connections: Mutex::new(connections),
            }),
        }
    }

    /// Close all connections. No-op after the first call.
    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let connections = match self.inner.connections.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        tracing::debug!(connections = connections.len(), "releasing tool bind");
        for connection in connections {
            connection.close().await;
        }
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }
}

// ─── Binder Contract ─────────────────────────────────────────────────────────

/// Binds the servers of a fingerprint into one flat tool set.
#[async_trait]
pub trait ToolBinder: Send + Sync {
    async fn bind(&self, config: &Fingerprint, provider: Provider)
        -> Result<BoundTools, McpError>;
}

/// Production binder: one fresh MCP connection per server.
pub struct McpToolBinder {
    transport: Arc<dyn Transport>,
    connect_timeout: Duration,
}

impl McpToolBinder {
    pub fn new(transport: Arc<dyn Transport>, connect_timeout: Duration) -> Self {
        Self {
            transport,
            connect_timeout,
        }
    }

    async fn bind_server(
        &self,
        server: &str,
        endpoint: &str,
        credential: Option<&str>,
        opened: &mut Vec<Arc<dyn Connection>>,
    ) -> Result<Vec<McpToolDefinition>, McpError> {
        let connection = open_connection(
            self.transport.as_ref(),
            server,
            endpoint,
            credential,
            self.connect_timeout,
        )
        .await?;
        opened.push(connection.clone());
        connection.discover_tools().await
    }
}

#[async_trait]
impl ToolBinder for McpToolBinder {
    async fn bind(
        &self,
        config: &Fingerprint,
        provider: Provider,
    ) -> Result<BoundTools, McpError> {
        let mut opened: Vec<Arc<dyn Connection>> = Vec::new();
        let mut tools = Vec::new();
        let mut seen = HashSet::new();

        for (server, cfg) in config.iter() {
            let discovered = match self
                .bind_server(server, &cfg.endpoint, cfg.credential.as_deref(), &mut opened)
                .await
            {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!(server, error = %e, "tool discovery failed, abandoning bind");
                    ReleaseHandle::new(opened).release().await;
                    return Err(McpError::DiscoveryFailed {
                        server: server.to_string(),
                        reason: e.reason(),
                    });
                }
            };

            // `opened` is non-empty here: bind_server pushed this server's connection.
            let Some(connection) = opened.last().cloned() else {
                continue;
            };
            tracing::info!(server, tools = discovered.len(), "tools discovered");

            for definition in discovered {
                let tool = BoundTool::new(server, definition, provider, connection.clone());
                if !seen.insert(tool.name.clone()) {
                    tracing::warn!(server, tool = %tool.name, "duplicate tool name after namespacing, skipping");
                    continue;
                }
                tools.push(tool);
            }
        }

        tracing::info!(
            servers = config.len(),
            tools = tools.len(),
            provider = provider.as_str(),
            "tool bind complete"
        );

        Ok(BoundTools {
            tools,
            release: ReleaseHandle::new(opened),
        })
    }
}

// ─── Naming & Schemas ────────────────────────────────────────────────────────

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Namespaced function name for a server's tool.
pub fn tool_name(server: &str, tool: &str) -> String {
    let mut name = format!("{}{NAME_SEPARATOR}{}", sanitize(server), sanitize(tool));
    // Sanitized names are ASCII, so byte truncation is safe.
    name.truncate(MAX_TOOL_NAME_LEN);
    name
}

/// Normalize a tool's input schema for the target provider.
///
/// Every provider gets a top-level object schema. Gemini rejects several
/// JSON-Schema keywords, so those are stripped recursively.
pub fn adapt_schema(schema: serde_json::Value, provider: Provider) -> serde_json::Value {
    let mut schema = match schema {
        serde_json::Value::Object(map) => serde_json::Value::Object(map),
        _ => serde_json::json!({}),
    };
    if let Some(obj) = schema.as_object_mut() {
        obj.entry("type")
            .or_insert_with(|| serde_json::Value::String("object".into()));
        obj.entry("properties")
            .or_insert_with(|| serde_json::json!({}));
    }
    if provider == Provider::Gemini {
        strip_keys(&mut schema, &["$schema", "additionalProperties"]);
    }
    schema
}

fn strip_keys(value: &mut serde_json::Value, keys: &[&str]) {
    match value {
        serde_json::Value::Object(map) => {
            for key in keys {
                map.remove(*key);
            }
            for child in map.values_mut() {
                strip_keys(child, keys);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                strip_keys(item, keys);
            }
        }
        _ => {}
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
