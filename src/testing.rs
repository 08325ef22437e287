//! In-process fakes for the transport, binder and model contracts.
//!
//! Each fake counts what it was asked to do so tests can assert on resource
//! ownership (opened vs. closed) without any network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::inference::types::{ChatMessage, ModelReply, Provider, TextStream, ToolDefinition};
use crate::inference::{
    DirectModel, InferenceError, ModelClient, ModelFactory, ProviderModel, StreamingModelClient,
};
use crate::mcp_client::types::ToolContent;
use crate::mcp_client::{
    BoundTool, BoundTools, CallToolResult, Connection, Fingerprint, McpError, McpToolDefinition,
    ReleaseHandle, ToolBinder, Transport,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Poll `done` until it holds, failing the test after a few seconds.
async fn wait_until(what: &str, done: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

// ─── Counters ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    attempts: AtomicUsize,
    opened: AtomicUsize,
    failed: AtomicUsize,
    closed: AtomicUsize,
    max_live: AtomicUsize,
}

impl Counters {
    fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

// ─── Fake Connection ─────────────────────────────────────────────────────────

/// A connection that answers from canned tool lists.
pub struct FakeConnection {
    endpoint: String,
    tools: Vec<McpToolDefinition>,
    fail_discovery: bool,
    closed: AtomicBool,
    counters: Arc<Counters>,
    invocations: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Connection for FakeConnection {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn discover_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        if self.fail_discovery {
            return Err(McpError::TransportError {
                endpoint: self.endpoint.clone(),
                reason: "tools/list failed".into(),
            });
        }
        Ok(self.tools.clone())
    }

    async fn invoke(
        &self,
        tool_name: &str,
        _arguments: serde_json::Value,
    ) -> Result<CallToolResult, McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::Closed {
                endpoint: self.endpoint.clone(),
            });
        }
        lock(&self.invocations).push(tool_name.to_string());
        Ok(CallToolResult {
            content: vec![ToolContent::Text {
                text: format!("called {tool_name}"),
            }],
            is_error: false,
        })
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ─── Fake Transport ──────────────────────────────────────────────────────────

/// Scripted outcome of one `open`.
pub enum OpenScript {
    Ok,
    Fail(String),
    /// Never completes.
    Hang,
    /// Succeeds once the gate is notified.
    Gated(Arc<Notify>),
}

impl OpenScript {
    pub fn ok() -> Self {
        OpenScript::Ok
    }

    pub fn fail(reason: &str) -> Self {
        OpenScript::Fail(reason.to_string())
    }

    pub fn hang() -> Self {
        OpenScript::Hang
    }

    pub fn gated(gate: Arc<Notify>) -> Self {
        OpenScript::Gated(gate)
    }
}

/// Transport whose opens follow a script (default: succeed).
#[derive(Default)]
pub struct FakeTransport {
    scripts: Mutex<VecDeque<OpenScript>>,
    tools: Mutex<HashMap<String, Vec<McpToolDefinition>>>,
    failing_discovery: Mutex<HashSet<String>>,
    last_credential: Mutex<Option<String>>,
    counters: Arc<Counters>,
    invocations: Arc<Mutex<Vec<String>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the outcome of the next unscripted open.
    pub fn script(&self, script: OpenScript) {
        lock(&self.scripts).push_back(script);
    }

    pub fn set_tools(&self, endpoint: &str, tools: Vec<McpToolDefinition>) {
        lock(&self.tools).insert(endpoint.to_string(), tools);
    }

    pub fn fail_discovery(&self, endpoint: &str) {
        lock(&self.failing_discovery).insert(endpoint.to_string());
    }

    /// Successful opens.
    pub fn opened(&self) -> usize {
        Counters::get(&self.counters.opened)
    }

    pub fn failed(&self) -> usize {
        Counters::get(&self.counters.failed)
    }

    pub fn closed(&self) -> usize {
        Counters::get(&self.counters.closed)
    }

    /// Opened and not yet closed.
    pub fn live(&self) -> usize {
        self.opened() - self.closed()
    }

    pub fn last_credential(&self) -> Option<String> {
        lock(&self.last_credential).clone()
    }

    /// Remote tool names invoked, in order.
    pub fn invocations(&self) -> Vec<String> {
        lock(&self.invocations).clone()
    }

    /// Wait until `n` opens have started.
    pub async fn wait_for_opens(&self, n: usize) {
        wait_until("opens", || Counters::get(&self.counters.attempts) >= n).await;
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(
        &self,
        endpoint: &str,
        credential: Option<&str>,
    ) -> Result<Arc<dyn Connection>, McpError> {
        *lock(&self.last_credential) = credential.map(str::to_string);
        self.counters.attempts.fetch_add(1, Ordering::SeqCst);

        let script = lock(&self.scripts).pop_front().unwrap_or(OpenScript::Ok);
        match script {
            OpenScript::Ok => {}
            OpenScript::Fail(reason) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                return Err(McpError::ConnectFailed {
                    endpoint: endpoint.to_string(),
                    reason,
                });
            }
            OpenScript::Hang => std::future::pending::<()>().await,
            OpenScript::Gated(gate) => gate.notified().await,
        }

        self.counters.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection {
            endpoint: endpoint.to_string(),
            tools: lock(&self.tools).get(endpoint).cloned().unwrap_or_default(),
            fail_discovery: lock(&self.failing_discovery).contains(endpoint),
            closed: AtomicBool::new(false),
            counters: self.counters.clone(),
            invocations: self.invocations.clone(),
        }))
    }
}

// ─── Fake Binder ─────────────────────────────────────────────────────────────

enum BindScript {
    Fail(String),
    Gated(Arc<Notify>),
}

/// Binder that hands out one fake connection per bind.
///
/// A bind counts as live from the moment it starts until it fails or its
/// release handle closes the connection.
#[derive(Default)]
pub struct FakeBinder {
    scripts: Mutex<VecDeque<BindScript>>,
    counters: Arc<Counters>,
    last_config: Mutex<Option<Fingerprint>>,
    invocations: Arc<Mutex<Vec<String>>>,
}

impl FakeBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the next bind until `gate` is notified.
    pub fn gate_next(&self, gate: Arc<Notify>) {
        lock(&self.scripts).push_back(BindScript::Gated(gate));
    }

    pub fn fail_next(&self, reason: &str) {
        lock(&self.scripts).push_back(BindScript::Fail(reason.to_string()));
    }

    /// Binds started.
    pub fn binds(&self) -> usize {
        Counters::get(&self.counters.attempts)
    }

    pub fn releases(&self) -> usize {
        Counters::get(&self.counters.closed)
    }

    pub fn live(&self) -> usize {
        self.binds() - Counters::get(&self.counters.failed) - self.releases()
    }

    /// Most binds ever live at once.
    pub fn max_live(&self) -> usize {
        Counters::get(&self.counters.max_live)
    }

    pub fn last_config(&self) -> Option<Fingerprint> {
        lock(&self.last_config).clone()
    }

    pub async fn wait_for_binds(&self, n: usize) {
        wait_until("binds", || self.binds() >= n).await;
    }
}

#[async_trait]
impl ToolBinder for FakeBinder {
    async fn bind(&self, config: &Fingerprint, provider: Provider) -> Result<BoundTools, McpError> {
        self.counters.attempts.fetch_add(1, Ordering::SeqCst);
        self.counters.max_live.fetch_max(self.live(), Ordering::SeqCst);
        *lock(&self.last_config) = Some(config.clone());

        let script = lock(&self.scripts).pop_front();
        match script {
            Some(BindScript::Fail(reason)) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                return Err(McpError::DiscoveryFailed {
                    server: config.iter().next().map(|(n, _)| n.to_string()).unwrap_or_default(),
                    reason,
                });
            }
            Some(BindScript::Gated(gate)) => gate.notified().await,
            None => {}
        }

        let connection: Arc<dyn Connection> = Arc::new(FakeConnection {
            endpoint: "fake://bind".into(),
            tools: Vec::new(),
            fail_discovery: false,
            closed: AtomicBool::new(false),
            counters: self.counters.clone(),
            invocations: self.invocations.clone(),
        });
        let tools = config
            .iter()
            .map(|(server, _)| {
                BoundTool::new(
                    server,
                    McpToolDefinition {
                        name: "echo".into(),
                        description: Some("Echo the input".into()),
                        input_schema: serde_json::json!({"type": "object"}),
                    },
                    provider,
                    connection.clone(),
                )
            })
            .collect();

        Ok(BoundTools {
            tools,
            release: ReleaseHandle::new(vec![connection]),
        })
    }
}

// ─── Fake Model ──────────────────────────────────────────────────────────────

/// Model with scripted completions and streams.
///
/// Queued replies feed `generate` and `complete` in order. Unscripted calls
/// echo the prompt (or the last user message).
pub struct FakeModel {
    provider: Provider,
    replies: Mutex<VecDeque<Result<ModelReply, InferenceError>>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    prompts: Mutex<Vec<String>>,
    stream: Mutex<Option<(Vec<String>, Option<String>)>>,
    reply_gate: Mutex<Option<Arc<Notify>>>,
}

impl FakeModel {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            stream: Mutex::new(None),
            reply_gate: Mutex::new(None),
        }
    }

    pub fn push_reply(&self, reply: ModelReply) {
        lock(&self.replies).push_back(Ok(reply));
    }

    pub fn push_error(&self, error: InferenceError) {
        lock(&self.replies).push_back(Err(error));
    }

    /// Message lists passed to `complete`, one per call.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.requests).clone()
    }

    /// Prompts passed to `generate` / `generate_stream`.
    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    /// Script the next stream: these chunks, then an optional error.
    pub fn set_stream(&self, chunks: &[&str], error: Option<&str>) {
        *lock(&self.stream) = Some((
            chunks.iter().map(|c| c.to_string()).collect(),
            error.map(str::to_string),
        ));
    }

    /// Hold `generate` and `generate_stream` until the returned gate is
    /// notified.
    pub fn hold_replies(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *lock(&self.reply_gate) = Some(gate.clone());
        gate
    }

    async fn wait_for_gate(&self) {
        let gate = lock(&self.reply_gate).clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }
}

#[async_trait]
impl ModelClient for FakeModel {
    fn provider(&self) -> Provider {
        self.provider
    }

    fn model(&self) -> &str {
        "fake-model"
    }

    async fn generate(&self, prompt: &str) -> Result<String, InferenceError> {
        lock(&self.prompts).push(prompt.to_string());
        self.wait_for_gate().await;
        match lock(&self.replies).pop_front() {
            Some(reply) => reply.map(|r| r.text.unwrap_or_default()),
            None => Ok(format!("echo: {prompt}")),
        }
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _tools: &[ToolDefinition],
    ) -> Result<ModelReply, InferenceError> {
        lock(&self.requests).push(messages.to_vec());
        if let Some(reply) = lock(&self.replies).pop_front() {
            return reply;
        }
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == crate::inference::Role::User)
            .map(|m| m.text().to_string())
            .unwrap_or_default();
        Ok(ModelReply::text(format!("echo: {last_user}")))
    }
}

#[async_trait]
impl StreamingModelClient for FakeModel {
    async fn generate_stream(&self, prompt: &str) -> Result<TextStream, InferenceError> {
        lock(&self.prompts).push(prompt.to_string());
        self.wait_for_gate().await;

        let (chunks, error) = lock(&self.stream)
            .take()
            .unwrap_or_else(|| (vec!["echo: ".to_string(), prompt.to_string()], None));
        let mut items: Vec<Result<String, InferenceError>> = chunks.into_iter().map(Ok).collect();
        if let Some(reason) = error {
            items.push(Err(InferenceError::StreamError { reason }));
        }
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

// ─── Fake Factory ────────────────────────────────────────────────────────────

/// Factory handing out one shared `FakeModel` per provider.
///
/// Claude is blocking, the others stream, as with the real providers.
#[derive(Default)]
pub struct FakeModelFactory {
    models: Mutex<HashMap<Provider, Arc<FakeModel>>>,
    created: Mutex<Vec<(Provider, String)>>,
    fail: AtomicBool,
}

impl FakeModelFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// The model instance shared by every client created for `provider`.
    pub fn model(&self, provider: Provider) -> Arc<FakeModel> {
        lock(&self.models)
            .entry(provider)
            .or_insert_with(|| Arc::new(FakeModel::new(provider)))
            .clone()
    }

    /// `(provider, credential)` of every successful create.
    pub fn created(&self) -> Vec<(Provider, String)> {
        lock(&self.created).clone()
    }
}

impl ModelFactory for FakeModelFactory {
    fn create(&self, provider: Provider, credential: &str) -> Result<ProviderModel, InferenceError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(InferenceError::ConfigError {
                reason: "model construction failed".into(),
            });
        }
        if credential.trim().is_empty() {
            return Err(InferenceError::MissingCredential {
                provider: provider.display_name().to_string(),
            });
        }
        lock(&self.created).push((provider, credential.to_string()));
        let model = self.model(provider);
        let direct = match provider {
            Provider::Claude => DirectModel::Blocking(model.clone()),
            _ => DirectModel::Streaming(model.clone()),
        };
        Ok(ProviderModel {
            client: model,
            direct,
        })
    }
}
