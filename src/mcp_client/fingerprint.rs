//! Connected-server fingerprint.
//!
//! A value snapshot of the servers that are currently connected, keyed by
//! server name. The agent is rebuilt only when this snapshot changes, so it
//! must ignore everything except name, endpoint and credential, and must not
//! depend on the order entries appear in the registry.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::registry::{ConnectionState, ServerEntry};

/// Endpoint and credential of one connected server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// Snapshot of the connected subset, `name → {endpoint, credential}`.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint(BTreeMap<String, ServerConfig>);

impl Fingerprint {
    /// Derive the fingerprint of the given registry entries.
    ///
    /// Only `Connected` entries contribute. If two connected entries share a
    /// name the first one wins.
    pub fn of(entries: &[ServerEntry]) -> Self {
        let mut servers = BTreeMap::new();
        for entry in entries
            .iter()
            .filter(|e| e.state == ConnectionState::Connected)
        {
            servers
                .entry(entry.name.clone())
                .or_insert_with(|| ServerConfig {
                    endpoint: entry.endpoint.clone(),
                    credential: entry
                        .credential
                        .as_deref()
                        .map(str::trim)
                        .filter(|c| !c.is_empty())
                        .map(str::to_string),
                });
        }
        Self(servers)
    }

    /// True when no server is connected.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Iterate servers in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServerConfig)> {
        self.0.iter().map(|(name, cfg)| (name.as_str(), cfg))
    }

    /// Canonical serialized form. Equal fingerprints serialize identically.
    pub fn canonical(&self) -> String {
        // BTreeMap keys serialize in sorted order; a map of plain strings
        // cannot fail to serialize.
        serde_json::to_string(&self.0).unwrap_or_default()
    }
}

impl FromIterator<(String, ServerConfig)> for Fingerprint {
    fn from_iter<I: IntoIterator<Item = (String, ServerConfig)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// Credentials never reach logs.
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("endpoint", &self.endpoint)
            .field("credential", &self.credential.as_ref().map(|_| "***"))
            .finish()
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.0.iter()).finish()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
