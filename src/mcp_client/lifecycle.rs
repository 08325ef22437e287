//! Connection lifecycle helpers.
//!
//! Opening a connection is bounded by the configured connect timeout, and
//! closing one is followed by a short settle delay so the old transport's
//! teardown cannot interleave with a fresh handshake against the same server.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use super::errors::McpError;
use super::transport::{Connection, Transport};

// ─── Opening ─────────────────────────────────────────────────────────────────

/// Open a connection to `endpoint` and complete the handshake within `timeout`.
///
/// A blank credential is treated as absent.
pub async fn open_connection(
    transport: &dyn Transport,
    server: &str,
    endpoint: &str,
    credential: Option<&str>,
    timeout: Duration,
) -> Result<Arc<dyn Connection>, McpError> {
    let credential = credential.map(str::trim).filter(|c| !c.is_empty());

    tracing::debug!(server, endpoint, auth = credential.is_some(), "opening MCP connection");

    match tokio::time::timeout(timeout, transport.open(endpoint, credential)).await {
        Ok(Ok(connection)) => {
            tracing::info!(server, endpoint, "MCP connection open");
            Ok(connection)
        }
        Ok(Err(e)) => {
            tracing::warn!(server, endpoint, error = %e, "MCP connection failed");
            Err(e)
        }
        Err(_) => {
            tracing::warn!(
                server,
                endpoint,
                timeout_ms = timeout.as_millis() as u64,
                "MCP connection timed out"
            );
            Err(McpError::Timeout {
                operation: format!("connect to '{server}'"),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }
}

// ─── Closing ─────────────────────────────────────────────────────────────────

/// Close a connection and wait for `settle` before returning.
pub async fn close_and_settle(connection: Arc<dyn Connection>, settle: Duration) {
    let endpoint = connection.endpoint().to_string();
    connection.close().await;
    tracing::debug!(
        endpoint = %endpoint,
        settle_ms = settle.as_millis() as u64,
        "MCP connection closed, settling"
    );
    if !settle.is_zero() {
        sleep(settle).await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
