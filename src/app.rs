//! ChatApp: the explicitly constructed service object.
//!
//! Owns every component and wires them together:
//! - Server list changes → fingerprint → agent lifecycle trigger
//! - Lifecycle phase and provider changes → conversation target kind
//! - Key and server edits → persisted stores
//!
//! Constructed once by the entry point; `start` loads persisted state and
//! `shutdown` releases every connection the app holds.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use thiserror::Error;
use tokio::task::JoinHandle;

use crate::agent_core::agent::AgentSettings;
use crate::agent_core::conversation::{ConversationSession, SendContext};
use crate::agent_core::lifecycle::{AgentLifecycle, AgentTrigger, LifecyclePhase};
use crate::agent_core::types::{ChatTurn, TargetKind};
use crate::agent_core::AgentError;
use crate::config::AppConfig;
use crate::inference::types::{ApiKeys, Provider};
use crate::inference::{DirectModel, HttpModelFactory, InferenceError, ModelFactory};
use crate::mcp_client::{
    Fingerprint, HttpTransport, McpError, McpToolBinder, RegistrySettings, ServerEntry, ServerId,
    ServerRegistry, ToolBinder, Transport,
};
use crate::storage::{CredentialStore, KeyValueStore, ServerListStore, SqliteStore, StoreError};

/// File name of the SQLite store inside the data directory.
pub const DATABASE_FILE_NAME: &str = "client.db";

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Mcp(#[from] McpError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("unknown server '{0}'")]
    UnknownServer(String),

    #[error("failed to prepare data directory {path}: {reason}")]
    DataDir { path: String, reason: String },
}

// ─── Services ────────────────────────────────────────────────────────────────

/// External collaborators the app is built from.
pub struct AppServices {
    pub store: Arc<dyn KeyValueStore>,
    pub transport: Arc<dyn Transport>,
    pub binder: Arc<dyn ToolBinder>,
    pub factory: Arc<dyn ModelFactory>,
}

impl AppServices {
    /// Production services: SQLite under `data_dir`, HTTP everywhere else.
    pub fn production(config: &AppConfig, data_dir: &Path) -> Result<Self, AppError> {
        std::fs::create_dir_all(data_dir).map_err(|e| AppError::DataDir {
            path: data_dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let store = SqliteStore::open(data_dir.join(DATABASE_FILE_NAME))?;
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(
            config.connect_timeout(),
            config.request_timeout(),
        )?);
        let binder = McpToolBinder::new(transport.clone(), config.connect_timeout());
        let factory = HttpModelFactory::new(
            config.providers.clone(),
            config.connect_timeout(),
            config.request_timeout(),
        )?;
        Ok(Self {
            store: Arc::new(store),
            transport,
            binder: Arc::new(binder),
            factory: Arc::new(factory),
        })
    }
}

// ─── Status ──────────────────────────────────────────────────────────────────

/// Point-in-time view for status displays.
#[derive(Debug, Clone)]
pub struct AppStatus {
    pub provider: Provider,
    /// Providers that have a key.
    pub available: Vec<Provider>,
    pub loaded: bool,
    pub phase: LifecyclePhase,
    pub target: Option<TargetKind>,
    pub tools: Vec<String>,
    pub servers: Vec<ServerEntry>,
}

// ─── ChatApp ─────────────────────────────────────────────────────────────────

struct AppState {
    keys: ApiKeys,
    provider: Provider,
    keys_loaded: bool,
    servers_loaded: bool,
    direct: Option<DirectModel>,
}

pub struct ChatApp {
    registry: Arc<ServerRegistry>,
    lifecycle: AgentLifecycle,
    session: Arc<ConversationSession>,
    factory: Arc<dyn ModelFactory>,
    credentials: CredentialStore,
    servers: ServerListStore,
    state: Mutex<AppState>,
    /// Serializes `refresh` from snapshot to lifecycle update.
    refresh_gate: Mutex<()>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

/// Provider selected on load: the first with a key, gemini by default.
pub fn initial_provider(keys: &ApiKeys) -> Provider {
    [Provider::Gemini, Provider::Claude, Provider::OpenAi]
        .into_iter()
        .find(|p| keys.has(*p))
        .unwrap_or(Provider::Gemini)
}

/// Provider to fall back to when the active one loses its key.
pub fn fallback_provider(current: Provider, keys: &ApiKeys) -> Provider {
    if keys.has(current) {
        return current;
    }
    [Provider::Gemini, Provider::OpenAi, Provider::Claude]
        .into_iter()
        .find(|p| keys.has(*p))
        .unwrap_or(current)
}

impl ChatApp {
    pub fn new(config: &AppConfig, services: AppServices) -> Arc<Self> {
        let registry = Arc::new(ServerRegistry::new(
            services.transport,
            RegistrySettings {
                settle_delay: config.settle_delay(),
                connect_timeout: config.connect_timeout(),
            },
        ));
        let lifecycle = AgentLifecycle::new(
            services.factory.clone(),
            services.binder,
            AgentSettings {
                max_rounds: config.agent_max_rounds,
                max_tool_result_chars: config.max_tool_result_chars,
                ..AgentSettings::default()
            },
        );
        Arc::new(Self {
            registry,
            lifecycle,
            session: Arc::new(ConversationSession::new(
                config.history_window,
                config.thread_id.clone(),
            )),
            factory: services.factory,
            credentials: CredentialStore::new(services.store.clone()),
            servers: ServerListStore::new(services.store),
            state: Mutex::new(AppState {
                keys: ApiKeys::default(),
                provider: Provider::Gemini,
                keys_loaded: false,
                servers_loaded: false,
                direct: None,
            }),
            refresh_gate: Mutex::new(()),
            watcher: Mutex::new(None),
        })
    }

    /// Build the production app rooted at `data_dir`.
    pub fn open(config: &AppConfig, data_dir: &Path) -> Result<Arc<Self>, AppError> {
        Ok(Self::new(config, AppServices::production(config, data_dir)?))
    }

    fn lock(&self) -> MutexGuard<'_, AppState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.registry
    }

    pub fn lifecycle(&self) -> &AgentLifecycle {
        &self.lifecycle
    }

    pub fn session(&self) -> &Arc<ConversationSession> {
        &self.session
    }

    /// Load persisted keys and servers, start watching, and auto-connect.
    ///
    /// Returns the auto-connect task.
    pub async fn start(self: &Arc<Self>) -> JoinHandle<()> {
        self.spawn_watcher();

        let keys = self.credentials.load().unwrap_or_default();
        let provider = initial_provider(&keys);
        {
            let mut state = self.lock();
            state.direct = self.direct_model(provider, &keys);
            state.keys = keys;
            state.provider = provider;
            state.keys_loaded = true;
        }
        tracing::info!(provider = provider.as_str(), "keys loaded");

        let stored = self.servers.load().unwrap_or_default();
        let count = stored.len();
        self.registry.load(stored).await;
        self.lock().servers_loaded = true;
        tracing::info!(servers = count, "server list loaded");

        self.refresh();

        let registry = self.registry.clone();
        tokio::spawn(async move { registry.auto_connect().await })
    }

    /// Re-run every watcher on registry and lifecycle changes.
    fn spawn_watcher(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut servers = self.registry.subscribe();
        let mut phase = self.lifecycle.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                let changed = tokio::select! {
                    changed = servers.changed() => changed,
                    changed = phase.changed() => changed,
                };
                if changed.is_err() {
                    break;
                }
                let Some(app) = weak.upgrade() else { break };
                app.refresh();
            }
        });
        let previous = self
            .watcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn direct_model(&self, provider: Provider, keys: &ApiKeys) -> Option<DirectModel> {
        let key = keys.get(provider)?;
        match self.factory.create(provider, key) {
            Ok(model) => Some(model.direct),
            Err(e) => {
                tracing::warn!(provider = provider.as_str(), error = %e, "direct model unavailable");
                None
            }
        }
    }

    fn loaded(state: &AppState) -> bool {
        state.keys_loaded && state.servers_loaded
    }

    /// Push the current trigger to the lifecycle and sync the session target.
    ///
    /// Returns the lifecycle task when the trigger changed. Concurrent calls
    /// are serialized so a trigger read earlier can never be applied after
    /// one read later.
    pub fn refresh(&self) -> Option<JoinHandle<()>> {
        let _serial = self.refresh_gate.lock().unwrap_or_else(|p| p.into_inner());
        let fingerprint = Fingerprint::of(&self.registry.snapshot());
        let (trigger, has_key) = {
            let state = self.lock();
            (
                AgentTrigger {
                    provider: state.provider,
                    credential: state.keys.get(state.provider).map(str::to_string),
                    fingerprint,
                    loaded: Self::loaded(&state),
                },
                state.keys.has(state.provider),
            )
        };
        let loaded = trigger.loaded;
        let provider = trigger.provider;
        let task = self.lifecycle.update(trigger);

        if loaded {
            let kind = match self.lifecycle.phase() {
                LifecyclePhase::Live { .. } => TargetKind::Agent,
                _ if has_key => TargetKind::Direct(provider),
                _ => TargetKind::Unavailable(provider),
            };
            self.session.sync_target(kind);
        }
        task
    }

    // ─── Servers ─────────────────────────────────────────────────────────────

    fn persist_servers(&self) -> Result<(), AppError> {
        self.servers.save(&self.registry.export())?;
        Ok(())
    }

    fn resolve(&self, id_or_name: &str) -> Result<ServerId, AppError> {
        self.registry
            .resolve(id_or_name)
            .ok_or_else(|| AppError::UnknownServer(id_or_name.to_string()))
    }

    pub fn add_server(
        &self,
        name: &str,
        endpoint: &str,
        credential: Option<&str>,
    ) -> Result<ServerId, AppError> {
        let id = self.registry.add(name, endpoint, credential)?;
        self.persist_servers()?;
        Ok(id)
    }

    pub async fn remove_server(&self, id_or_name: &str) -> Result<(), AppError> {
        let id = self.resolve(id_or_name)?;
        self.registry.remove(&id).await;
        self.persist_servers()
    }

    /// Connect a server and return its resulting entry.
    pub async fn connect_server(&self, id_or_name: &str) -> Result<ServerEntry, AppError> {
        let id = self.resolve(id_or_name)?;
        self.registry.connect(&id).await;
        self.registry
            .get(&id)
            .ok_or_else(|| AppError::UnknownServer(id_or_name.to_string()))
    }

    // ─── Providers ───────────────────────────────────────────────────────────

    /// Store a provider key (blank clears it) and persist all keys.
    pub fn set_key(&self, provider: Provider, key: &str) -> Result<Provider, AppError> {
        let (keys, active) = {
            let mut state = self.lock();
            state.keys.set(provider, key);
            let active = fallback_provider(state.provider, &state.keys);
            if active != state.provider {
                tracing::info!(
                    from = state.provider.as_str(),
                    to = active.as_str(),
                    "active provider lost its key, switching"
                );
            }
            state.provider = active;
            (state.keys.clone(), active)
        };
        let direct = self.direct_model(active, &keys);
        self.lock().direct = direct;
        self.credentials.save(&keys)?;
        self.refresh();
        Ok(active)
    }

    pub fn set_provider(&self, provider: Provider) {
        let keys = {
            let mut state = self.lock();
            state.provider = provider;
            state.keys.clone()
        };
        let direct = self.direct_model(provider, &keys);
        self.lock().direct = direct;
        tracing::info!(provider = provider.as_str(), "provider selected");
        self.refresh();
    }

    pub fn provider(&self) -> Provider {
        self.lock().provider
    }

    // ─── Conversation ────────────────────────────────────────────────────────

    /// Send one message through the session.
    pub async fn send(&self, text: &str) -> Result<ChatTurn, AppError> {
        let ctx = {
            let state = self.lock();
            SendContext {
                loaded: Self::loaded(&state),
                agent: self.lifecycle.current(),
                direct: state.direct.clone(),
                any_connected: self.registry.any_connected(),
            }
        };
        Ok(self.session.send(text, ctx).await?)
    }

    pub fn history(&self) -> Vec<ChatTurn> {
        self.session.turns()
    }

    pub fn status(&self) -> AppStatus {
        let state = self.lock();
        AppStatus {
            provider: state.provider,
            available: Provider::ALL
                .into_iter()
                .filter(|p| state.keys.has(*p))
                .collect(),
            loaded: Self::loaded(&state),
            phase: self.lifecycle.phase(),
            target: self.session.target(),
            tools: self
                .lifecycle
                .current()
                .map(|agent| agent.tool_names().iter().map(|n| n.to_string()).collect())
                .unwrap_or_default(),
            servers: self.registry.snapshot(),
        }
    }

    /// Stop watching, release the live generation and close every server.
    pub async fn shutdown(&self) {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        self.lifecycle.shutdown().await;
        self.registry.close_all().await;
        tracing::info!("chat app shut down");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
