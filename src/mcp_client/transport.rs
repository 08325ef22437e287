//! JSON-RPC over streamable HTTP.
//!
//! Defines the transport contract the registry and binder depend on, plus the
//! production implementation:
//! - One `POST` per JSON-RPC message to the server endpoint
//! - Responses arrive as plain JSON or as a single SSE `data:` event
//! - `Authorization: Bearer …` on every call when a credential is configured
//! - `mcp-session-id` captured from the server and echoed on later calls

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client as HttpClient;

use super::errors::McpError;
use super::types::{
    CallToolResult, InitializeResult, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse,
    ListToolsResult, McpToolDefinition, CLIENT_NAME, PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Header carrying the server-assigned session identifier.
const SESSION_HEADER: &str = "mcp-session-id";

/// Upper bound on `tools/list` pages followed for one server.
const MAX_TOOL_PAGES: usize = 32;

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Contracts ───────────────────────────────────────────────────────────────

/// An open session with one remote tool server.
///
/// `close` must be idempotent; calls after close fail with `McpError::Closed`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The endpoint this connection talks to.
    fn endpoint(&self) -> &str;

    /// List every tool the server exposes.
    async fn discover_tools(&self) -> Result<Vec<McpToolDefinition>, McpError>;

    /// Invoke one tool by its server-local name.
    async fn invoke(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError>;

    /// Tear the session down.
    async fn close(&self);
}

/// Opens connections to remote tool servers.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection and complete the protocol handshake.
    async fn open(
        &self,
        endpoint: &str,
        credential: Option<&str>,
    ) -> Result<Arc<dyn Connection>, McpError>;
}

// ─── HTTP Transport ──────────────────────────────────────────────────────────

/// Streamable-HTTP transport backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct HttpTransport {
    http: HttpClient,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Build a transport with the given connect and per-request timeouts.
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Result<Self, McpError> {
        let http = HttpClient::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()
            .map_err(|e| McpError::ConfigError {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            http,
            request_timeout,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(
        &self,
        endpoint: &str,
        credential: Option<&str>,
    ) -> Result<Arc<dyn Connection>, McpError> {
        let url = reqwest::Url::parse(endpoint).map_err(|e| McpError::ConfigError {
            reason: format!("invalid endpoint '{endpoint}': {e}"),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(McpError::ConfigError {
                reason: format!("unsupported scheme '{}' for '{endpoint}'", url.scheme()),
            });
        }

        let auth_header = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(|c| format!("Bearer {c}"));

        let connection = HttpConnection {
            http: self.http.clone(),
            request_timeout: self.request_timeout,
            endpoint: endpoint.to_string(),
            auth_header,
            session_id: Mutex::new(None),
            closed: AtomicBool::new(false),
        };

        connection.initialize().await?;
        Ok(Arc::new(connection))
    }
}

// ─── HTTP Connection ─────────────────────────────────────────────────────────

/// One MCP session over HTTP.
pub struct HttpConnection {
    http: HttpClient,
    /// Whole-request bound the client enforces; reported on timeouts.
    request_timeout: Duration,
    endpoint: String,
    auth_header: Option<String>,
    session_id: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl HttpConnection {
    fn current_session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|guard| guard.clone())
    }

    fn remember_session_id(&self, response: &reqwest::Response) {
        let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        if let Ok(mut guard) = self.session_id.lock() {
            *guard = Some(id.to_string());
        }
    }

    fn ensure_open(&self) -> Result<(), McpError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McpError::Closed {
                endpoint: self.endpoint.clone(),
            });
        }
        Ok(())
    }

    fn map_send_error(&self, operation: &str, e: reqwest::Error) -> McpError {
        if e.is_timeout() {
            McpError::Timeout {
                operation: operation.to_string(),
                timeout_ms: u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX),
            }
        } else if e.is_connect() {
            McpError::ConnectFailed {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            }
        } else {
            McpError::TransportError {
                endpoint: self.endpoint.clone(),
                reason: e.to_string(),
            }
        }
    }

    async fn post(&self, operation: &str, payload: String) -> Result<reqwest::Response, McpError> {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(payload);

        if let Some(auth) = &self.auth_header {
            request = request.header("Authorization", auth);
        }
        if let Some(session_id) = self.current_session_id() {
            request = request.header(SESSION_HEADER, session_id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.map_send_error(operation, e))?;

        tracing::debug!(
            endpoint = %self.endpoint,
            operation,
            status = %response.status(),
            "received MCP HTTP response"
        );

        if !response.status().is_success() {
            return Err(McpError::HttpError {
                endpoint: self.endpoint.clone(),
                status: response.status().as_u16(),
            });
        }

        self.remember_session_id(&response);
        Ok(response)
    }

    /// Send a JSON-RPC request and wait for the matching response.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        self.ensure_open()?;

        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let payload = serde_json::to_string(&req).map_err(|e| McpError::TransportError {
            endpoint: self.endpoint.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;

        let response = self.post(method, payload).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response.text().await.map_err(|e| McpError::TransportError {
            endpoint: self.endpoint.clone(),
            reason: format!("failed to read response body: {e}"),
        })?;

        let parsed = parse_response_body(&self.endpoint, &content_type, &body, id)?;
        extract_result(parsed)
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.ensure_open()?;

        let notification = JsonRpcNotification::new(method, params);
        let payload =
            serde_json::to_string(&notification).map_err(|e| McpError::TransportError {
                endpoint: self.endpoint.clone(),
                reason: format!("failed to serialize notification: {e}"),
            })?;

        self.post(method, payload).await?;
        Ok(())
    }

    /// Perform the MCP initialization handshake.
    async fn initialize(&self) -> Result<(), McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = self
            .request("initialize", Some(params))
            .await
            .map_err(|e| match e {
                McpError::ServerError { message, .. } => McpError::InitFailed {
                    endpoint: self.endpoint.clone(),
                    reason: message,
                },
                other => other,
            })?;

        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                endpoint: self.endpoint.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        tracing::info!(
            endpoint = %self.endpoint,
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            server = init
                .server_info
                .as_ref()
                .and_then(|s| s.name.as_deref())
                .unwrap_or("unknown"),
            "MCP session initialized"
        );

        self.notify("notifications/initialized", None).await
    }
}

#[async_trait]
impl Connection for HttpConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn discover_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let result = self.request("tools/list", params).await?;
            let page: ListToolsResult =
                serde_json::from_value(result).map_err(|e| McpError::TransportError {
                    endpoint: self.endpoint.clone(),
                    reason: format!("failed to parse tools/list response: {e}"),
                })?;

            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }

        tracing::warn!(
            endpoint = %self.endpoint,
            pages = MAX_TOOL_PAGES,
            "tools/list pagination limit reached"
        );
        Ok(tools)
    }

    async fn invoke(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let result = self.request("tools/call", Some(params)).await?;
        serde_json::from_value(result).map_err(|e| McpError::TransportError {
            endpoint: self.endpoint.clone(),
            reason: format!("failed to parse tools/call response: {e}"),
        })
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // Best-effort session termination; servers without sessions skip it.
        let Some(session_id) = self.current_session_id() else {
            return;
        };
        let mut request = self
            .http
            .delete(&self.endpoint)
            .header(SESSION_HEADER, session_id);
        if let Some(auth) = &self.auth_header {
            request = request.header("Authorization", auth);
        }
        if let Err(e) = request.send().await {
            tracing::debug!(endpoint = %self.endpoint, error = %e, "session DELETE failed");
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Parse an HTTP response body into the JSON-RPC response for `id`.
///
/// SSE bodies may carry several events (server requests, notifications);
/// only the response whose id matches is returned.
pub fn parse_response_body(
    endpoint: &str,
    content_type: &str,
    body: &str,
    id: u64,
) -> Result<JsonRpcResponse, McpError> {
    if content_type.starts_with("text/event-stream") {
        for line in body.lines() {
            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            match serde_json::from_str::<JsonRpcResponse>(data.trim()) {
                Ok(resp) if resp.id == Some(id) => return Ok(resp),
                // Not ours, or not a response at all.
                _ => continue,
            }
        }
        return Err(McpError::TransportError {
            endpoint: endpoint.to_string(),
            reason: format!("event stream carried no response for request {id}"),
        });
    }

    serde_json::from_str::<JsonRpcResponse>(body).map_err(|e| McpError::TransportError {
        endpoint: endpoint.to_string(),
        reason: format!("failed to parse JSON-RPC response: {e}"),
    })
}

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_request_id_is_monotonic() {
        let id1 = next_request_id();
        let id2 = next_request_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_extract_result_success() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(1),
            result: Some(serde_json::json!({"tools": []})),
            error: None,
        };
        let result = extract_result(resp).unwrap();
        assert!(result["tools"].is_array());
    }

    #[test]
    fn test_extract_result_error() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(1),
            result: None,
            error: Some(super::super::types::JsonRpcError {
                code: -32601,
                message: "Method not found".into(),
                data: None,
            }),
        };
        match extract_result(resp).unwrap_err() {
            McpError::ServerError { code, message, .. } => {
                assert_eq!(code, -32601);
                assert_eq!(message, "Method not found");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
    }

    #[test]
    fn test_extract_result_missing_both() {
        let resp = JsonRpcResponse {
            jsonrpc: "2.0".into(),
            id: Some(1),
            result: None,
            error: None,
        };
        assert!(matches!(
            extract_result(resp).unwrap_err(),
            McpError::ServerError { .. }
        ));
    }

    #[test]
    fn test_parse_plain_json_body() {
        let body = r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#;
        let resp = parse_response_body("https://x/mcp", "application/json", body, 7).unwrap();
        assert_eq!(resp.id, Some(7));
        assert_eq!(resp.result.unwrap()["ok"], true);
    }

    #[test]
    fn test_parse_sse_body_picks_matching_id() {
        let body = "event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\"}\n\n\
                    event: message\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":3,\"result\":{\"n\":1}}\n\n\
                    data: {\"jsonrpc\":\"2.0\",\"id\":4,\"result\":{\"n\":2}}\n\n";
        let resp = parse_response_body("https://x/mcp", "text/event-stream", body, 4).unwrap();
        assert_eq!(resp.result.unwrap()["n"], 2);
    }

    #[test]
    fn test_parse_sse_body_without_response() {
        let body = "data: {\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n\n";
        let err =
            parse_response_body("https://x/mcp", "text/event-stream; charset=utf-8", body, 9)
                .unwrap_err();
        assert!(matches!(err, McpError::TransportError { .. }));
    }

    #[tokio::test]
    async fn test_timeout_reports_configured_request_timeout() {
        // Accepts the connection but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let transport =
            HttpTransport::new(Duration::from_secs(1), Duration::from_millis(150)).unwrap();
        let err = transport
            .open(&format!("http://{addr}/mcp"), None)
            .await
            .err()
            .unwrap();
        match err {
            McpError::Timeout { timeout_ms, .. } => assert_eq!(timeout_ms, 150),
            other => panic!("expected Timeout, got {other:?}"),
        }
        server.abort();
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_endpoint() {
        let transport =
            HttpTransport::new(Duration::from_secs(1), Duration::from_secs(1)).unwrap();
        let err = transport.open("not a url", None).await.err().unwrap();
        assert!(matches!(err, McpError::ConfigError { .. }));

        let err = transport.open("ftp://x/mcp", None).await.err().unwrap();
        assert!(err.to_string().contains("unsupported scheme"));
    }
}
