//! Server registry: the configured remote tool servers and their connections.
//!
//! Provides:
//! - Add / remove of server entries (unique, trimmed names)
//! - Connect with close-and-settle of any previous connection
//! - Supersession of overlapping connect attempts via per-attempt tokens
//! - A `watch` channel publishing every change to the entry list
//! - Load / export of the persisted list (connections are never persisted)
//!
//! The entry list is owned here. Consumers read snapshots and call the
//! operations below; they never mutate entries directly.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::errors::McpError;
use super::lifecycle::{close_and_settle, open_connection};
use super::transport::{Connection, Transport};

// ─── Types ───────────────────────────────────────────────────────────────────

/// Opaque, stable entry identifier.
pub type ServerId = String;

/// Connection state of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }
}

/// One configured server, as seen by consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerEntry {
    pub id: ServerId,
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub credential: Option<String>,
    pub state: ConnectionState,
    pub status_detail: String,
}

impl ServerEntry {
    /// A fresh idle entry with a newly generated id.
    pub fn new(name: &str, endpoint: &str, credential: Option<&str>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            endpoint: endpoint.trim().to_string(),
            credential: credential
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string),
            state: ConnectionState::Idle,
            status_detail: status_idle(),
        }
    }
}

/// The persisted form of an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredServer {
    pub id: ServerId,
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub credential: Option<String>,
}

/// Timing knobs for connect attempts.
#[derive(Debug, Clone, Copy)]
pub struct RegistrySettings {
    /// Delay after closing a connection before opening the next one.
    pub settle_delay: Duration,
    /// Upper bound on opening a connection (including the handshake).
    pub connect_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

// ─── Status Text ─────────────────────────────────────────────────────────────

fn status_idle() -> String {
    "Not Connected".to_string()
}

fn status_connecting(name: &str) -> String {
    format!("Connecting to {name}...")
}

fn status_connected() -> String {
    "Connected to MCP server.".to_string()
}

fn status_failed(reason: &str) -> String {
    format!("Failed to connect: {}.", reason.trim_end_matches('.'))
}

// ─── Internal State ──────────────────────────────────────────────────────────

struct Slot {
    entry: ServerEntry,
    /// Present only while `Connecting` (previous connection awaiting close)
    /// or `Connected`.
    connection: Option<Arc<dyn Connection>>,
    /// Token of the attempt allowed to commit a result for this entry.
    attempt: u64,
}

#[derive(Default)]
struct RegistryState {
    slots: Vec<Slot>,
    next_attempt: u64,
    /// Entries loaded from storage that still owe their one auto-connect.
    pending_auto_connect: Vec<ServerId>,
}

impl RegistryState {
    fn slot_mut(&mut self, id: &str) -> Option<&mut Slot> {
        self.slots.iter_mut().find(|s| s.entry.id == id)
    }

    fn entries(&self) -> Vec<ServerEntry> {
        self.slots.iter().map(|s| s.entry.clone()).collect()
    }
}

// ─── ServerRegistry ──────────────────────────────────────────────────────────

/// Owner of the server entry list and each entry's live connection.
pub struct ServerRegistry {
    transport: Arc<dyn Transport>,
    settings: RegistrySettings,
    state: Mutex<RegistryState>,
    changes: watch::Sender<Vec<ServerEntry>>,
}

impl ServerRegistry {
    pub fn new(transport: Arc<dyn Transport>, settings: RegistrySettings) -> Self {
        let (changes, _) = watch::channel(Vec::new());
        Self {
            transport,
            settings,
            state: Mutex::new(RegistryState::default()),
            changes,
        }
    }

    // The guard never lives across an await, so a poisoned lock only means a
    // panic elsewhere; keep serving the data.
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &RegistryState) {
        self.changes.send_replace(state.entries());
    }

    /// Subscribe to entry-list changes. The receiver starts at the current list.
    pub fn subscribe(&self) -> watch::Receiver<Vec<ServerEntry>> {
        self.changes.subscribe()
    }

    /// Current entries, in insertion order.
    pub fn snapshot(&self) -> Vec<ServerEntry> {
        self.lock().entries()
    }

    /// Look up one entry.
    pub fn get(&self, id: &str) -> Option<ServerEntry> {
        self.lock()
            .slots
            .iter()
            .find(|s| s.entry.id == id)
            .map(|s| s.entry.clone())
    }

    /// Resolve an id or a name to an entry id.
    pub fn resolve(&self, id_or_name: &str) -> Option<ServerId> {
        let state = self.lock();
        state
            .slots
            .iter()
            .find(|s| s.entry.id == id_or_name)
            .or_else(|| state.slots.iter().find(|s| s.entry.name == id_or_name))
            .map(|s| s.entry.id.clone())
    }

    /// Whether any entry is connected.
    pub fn any_connected(&self) -> bool {
        self.lock()
            .slots
            .iter()
            .any(|s| s.entry.state == ConnectionState::Connected)
    }

    // ─── Mutations ───────────────────────────────────────────────────────

    /// Append a new idle entry.
    ///
    /// Rejects blank names or endpoints and names already in use.
    pub fn add(
        &self,
        name: &str,
        endpoint: &str,
        credential: Option<&str>,
    ) -> Result<ServerId, McpError> {
        let entry = ServerEntry::new(name, endpoint, credential);
        if entry.name.is_empty() || entry.endpoint.is_empty() {
            return Err(McpError::ConfigError {
                reason: "server name and endpoint are required".into(),
            });
        }

        let mut state = self.lock();
        if state.slots.iter().any(|s| s.entry.name == entry.name) {
            return Err(McpError::ConfigError {
                reason: format!("a server named '{}' already exists", entry.name),
            });
        }

        let id = entry.id.clone();
        tracing::info!(server = %entry.name, endpoint = %entry.endpoint, id = %id, "server added");
        state.slots.push(Slot {
            entry,
            connection: None,
            attempt: 0,
        });
        self.publish(&state);
        Ok(id)
    }

    /// Close the entry's connection (if any) and delete it. Unknown ids are a no-op.
    pub async fn remove(&self, id: &str) {
        let removed = {
            let mut state = self.lock();
            let Some(index) = state.slots.iter().position(|s| s.entry.id == id) else {
                return;
            };
            let slot = state.slots.remove(index);
            state.pending_auto_connect.retain(|p| p != id);
            self.publish(&state);
            slot
        };

        tracing::info!(server = %removed.entry.name, id, "server removed");
        if let Some(connection) = removed.connection {
            connection.close().await;
        }
    }

    /// Connect (or reconnect) one entry.
    ///
    /// Any existing connection is closed first and the settle delay observed.
    /// A later `connect` for the same entry supersedes this one: whatever this
    /// attempt produces afterwards is discarded and its connection closed.
    pub async fn connect(&self, id: &str) {
        let (token, name, endpoint, credential, previous) = {
            let mut state = self.lock();
            state.next_attempt += 1;
            let token = state.next_attempt;
            let Some(slot) = state.slot_mut(id) else {
                return;
            };
            slot.attempt = token;
            slot.entry.state = ConnectionState::Connecting;
            slot.entry.status_detail = status_connecting(&slot.entry.name);
            let previous = slot.connection.take();
            let out = (
                token,
                slot.entry.name.clone(),
                slot.entry.endpoint.clone(),
                slot.entry.credential.clone(),
                previous,
            );
            self.publish(&state);
            out
        };

        tracing::info!(server = %name, attempt = token, "connecting");

        if let Some(previous) = previous {
            close_and_settle(previous, self.settings.settle_delay).await;
        }

        if !self.is_current(id, token) {
            tracing::debug!(server = %name, attempt = token, "connect superseded before open");
            return;
        }

        let result = open_connection(
            self.transport.as_ref(),
            &name,
            &endpoint,
            credential.as_deref(),
            self.settings.connect_timeout,
        )
        .await;

        let stale = {
            let mut state = self.lock();
            match state.slot_mut(id) {
                Some(slot) if slot.attempt == token => {
                    match result {
                        Ok(connection) => {
                            slot.entry.state = ConnectionState::Connected;
                            slot.entry.status_detail = status_connected();
                            slot.connection = Some(connection);
                            tracing::info!(server = %name, attempt = token, "connected");
                        }
                        Err(e) => {
                            slot.entry.state = ConnectionState::Error;
                            slot.entry.status_detail = status_failed(&e.reason());
                            tracing::warn!(server = %name, attempt = token, error = %e, "connect failed");
                        }
                    }
                    self.publish(&state);
                    None
                }
                _ => result.ok(),
            }
        };

        if let Some(connection) = stale {
            tracing::info!(server = %name, attempt = token, "discarding stale connection");
            connection.close().await;
        }
    }

    fn is_current(&self, id: &str, token: u64) -> bool {
        self.lock()
            .slots
            .iter()
            .any(|s| s.entry.id == id && s.attempt == token)
    }

    // ─── Persistence ─────────────────────────────────────────────────────

    /// Replace the entry list with a persisted one.
    ///
    /// Every entry starts `Idle` without a connection. Duplicate names keep
    /// the first occurrence. Loaded entries are queued for one auto-connect.
    /// Existing connections are closed.
    pub async fn load(&self, stored: Vec<StoredServer>) {
        let old: Vec<Arc<dyn Connection>> = {
            let mut state = self.lock();
            let old = state
                .slots
                .drain(..)
                .filter_map(|s| s.connection)
                .collect();

            for server in stored {
                let name = server.name.trim().to_string();
                if name.is_empty() || server.endpoint.trim().is_empty() {
                    tracing::warn!(id = %server.id, "skipping persisted server without name or endpoint");
                    continue;
                }
                if state.slots.iter().any(|s| s.entry.name == name) {
                    tracing::warn!(server = %name, "skipping persisted server with duplicate name");
                    continue;
                }
                let mut entry = ServerEntry::new(&name, &server.endpoint, server.credential.as_deref());
                if !server.id.is_empty() {
                    entry.id = server.id;
                }
                state.slots.push(Slot {
                    entry,
                    connection: None,
                    attempt: 0,
                });
            }

            state.pending_auto_connect = state.slots.iter().map(|s| s.entry.id.clone()).collect();
            tracing::info!(count = state.slots.len(), "server list loaded");
            self.publish(&state);
            old
        };

        for connection in old {
            connection.close().await;
        }
    }

    /// Connect every loaded entry that is still idle, once.
    ///
    /// Subsequent calls do nothing; failed entries are not retried.
    pub async fn auto_connect(&self) {
        let ids: Vec<ServerId> = {
            let mut state = self.lock();
            let pending = std::mem::take(&mut state.pending_auto_connect);
            pending
                .into_iter()
                .filter(|id| {
                    state
                        .slots
                        .iter()
                        .any(|s| &s.entry.id == id && s.entry.state == ConnectionState::Idle)
                })
                .collect()
        };

        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "auto-connecting loaded servers");
        futures::future::join_all(ids.iter().map(|id| self.connect(id))).await;
    }

    /// The persistable form of the current list.
    pub fn export(&self) -> Vec<StoredServer> {
        self.lock()
            .slots
            .iter()
            .map(|s| StoredServer {
                id: s.entry.id.clone(),
                name: s.entry.name.clone(),
                endpoint: s.entry.endpoint.clone(),
                credential: s.entry.credential.clone(),
            })
            .collect()
    }

    /// Close every connection and return all entries to `Idle`.
    ///
    /// In-flight attempts are superseded and will close what they open.
    pub async fn close_all(&self) {
        let connections: Vec<Arc<dyn Connection>> = {
            let mut state = self.lock();
            state.next_attempt += 1;
            let token = state.next_attempt;
            let mut out = Vec::new();
            for slot in &mut state.slots {
                slot.attempt = token;
                slot.entry.state = ConnectionState::Idle;
                slot.entry.status_detail = status_idle();
                out.extend(slot.connection.take());
            }
            self.publish(&state);
            out
        };

        tracing::info!(count = connections.len(), "closing all server connections");
        for connection in connections {
            connection.close().await;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
