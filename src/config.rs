//! Application configuration loading.
//!
//! Reads `config.yaml` and resolves environment variables. Every field is
//! optional; a missing file yields the built-in defaults.
//!
//! Lookup order:
//! 1. An explicit path (the `--config` flag)
//! 2. `MCP_LLM_CLIENT_CONFIG`
//! 3. `<data_dir>/config.yaml`
//! 4. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::inference::types::Provider;

/// Env var naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "MCP_LLM_CLIENT_CONFIG";

/// Config file name inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config.yaml";

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors raised while locating or parsing the config file.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Connection settings for one model provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
}

impl ProviderSettings {
    /// Built-in endpoint and model for a provider.
    pub fn default_for(provider: Provider) -> Self {
        let (base_url, model) = match provider {
            Provider::OpenAi => ("https://api.openai.com/v1", "gpt-4o-mini"),
            Provider::Claude => ("https://api.anthropic.com/v1", "claude-3-5-sonnet-latest"),
            Provider::Gemini => (
                "https://generativelanguage.googleapis.com/v1beta",
                "gemini-2.5-flash",
            ),
        };
        Self {
            base_url: base_url.to_string(),
            model: model.to_string(),
            max_tokens: 4096,
        }
    }
}

/// Per-provider overrides as written in the file; unset fields keep the
/// provider's own defaults.
#[derive(Debug, Default, Deserialize)]
struct RawProviderSettings {
    base_url: Option<String>,
    model: Option<String>,
    max_tokens: Option<u32>,
}

impl RawProviderSettings {
    fn resolve(self, provider: Provider) -> ProviderSettings {
        let defaults = ProviderSettings::default_for(provider);
        ProviderSettings {
            base_url: self
                .base_url
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.base_url),
            model: self.model.unwrap_or(defaults.model),
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RawProviders {
    #[serde(default)]
    openai: RawProviderSettings,
    #[serde(default)]
    claude: RawProviderSettings,
    #[serde(default)]
    gemini: RawProviderSettings,
}

/// Per-provider settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(from = "RawProviders")]
pub struct ProvidersConfig {
    pub openai: ProviderSettings,
    pub claude: ProviderSettings,
    pub gemini: ProviderSettings,
}

impl From<RawProviders> for ProvidersConfig {
    fn from(raw: RawProviders) -> Self {
        Self {
            openai: raw.openai.resolve(Provider::OpenAi),
            claude: raw.claude.resolve(Provider::Claude),
            gemini: raw.gemini.resolve(Provider::Gemini),
        }
    }
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        RawProviders::default().into()
    }
}

impl ProvidersConfig {
    pub fn get(&self, provider: Provider) -> &ProviderSettings {
        match provider {
            Provider::OpenAi => &self.openai,
            Provider::Claude => &self.claude,
            Provider::Gemini => &self.gemini,
        }
    }
}

/// Top-level application configuration (mirrors `config.yaml`).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Most recent turns replayed to the agent on each send.
    pub history_window: usize,
    /// Fixed conversation thread identifier passed to the agent.
    pub thread_id: String,
    /// Delay after closing a server connection before reconnecting.
    pub settle_delay_ms: u64,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// Tool-calling rounds before the agent gives up.
    pub agent_max_rounds: usize,
    /// Tool output longer than this is truncated before reaching the model.
    pub max_tool_result_chars: usize,
    pub providers: ProvidersConfig,
    /// Overrides the platform data directory.
    pub data_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            history_window: 20,
            thread_id: "chat-thread".to_string(),
            settle_delay_ms: 50,
            connect_timeout_secs: 15,
            request_timeout_secs: 60,
            agent_max_rounds: 8,
            max_tool_result_chars: 6000,
            providers: ProvidersConfig::default(),
            data_dir: None,
        }
    }
}

impl AppConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Reject values that would make the client unusable.
    pub fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.history_window == 0 {
            return Err(ConfigLoadError::Invalid {
                reason: "history_window must be at least 1".into(),
            });
        }
        if self.agent_max_rounds == 0 {
            return Err(ConfigLoadError::Invalid {
                reason: "agent_max_rounds must be at least 1".into(),
            });
        }
        if self.thread_id.trim().is_empty() {
            return Err(ConfigLoadError::Invalid {
                reason: "thread_id must not be blank".into(),
            });
        }
        for provider in Provider::ALL {
            if self.providers.get(provider).base_url.trim().is_empty() {
                return Err(ConfigLoadError::Invalid {
                    reason: format!("providers.{}.base_url must not be blank", provider.as_str()),
                });
            }
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Resolve which config file to read, if any.
pub fn find_config_path(explicit: Option<&Path>, data_dir: &Path) -> Option<PathBuf> {
    // 1. Explicit flag
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }

    // 2. Env var
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(expand_tilde(path.trim())));
        }
    }

    // 3. Data directory
    let candidate = data_dir.join(CONFIG_FILE_NAME);
    candidate.exists().then_some(candidate)
}

/// Load and parse a config file.
///
/// Performs environment-variable interpolation on string values matching
/// `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigLoadError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigLoadError::Read {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;

    parse_config(&raw).map_err(|e| match e {
        ConfigLoadError::Parse { reason, .. } => ConfigLoadError::Parse {
            path: path.display().to_string(),
            reason,
        },
        other => other,
    })
}

/// Parse config text. Empty input yields the defaults.
pub fn parse_config(raw: &str) -> Result<AppConfig, ConfigLoadError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(AppConfig::default());
    }

    let mut config: AppConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| ConfigLoadError::Parse {
            path: "<inline>".into(),
            reason: e.to_string(),
        })?;

    config.data_dir = config
        .data_dir
        .map(|dir| PathBuf::from(expand_tilde(&dir.to_string_lossy())));
    config.validate()?;
    Ok(config)
}

/// Locate and load the config, falling back to defaults when none exists.
pub fn load_or_default(
    explicit: Option<&Path>,
    data_dir: &Path,
) -> Result<AppConfig, ConfigLoadError> {
    match find_config_path(explicit, data_dir) {
        Some(path) => {
            let config = load_config(&path)?;
            tracing::info!(path = %path.display(), "loaded config");
            Ok(config)
        }
        None => {
            tracing::info!("no config file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((var_name, default)) => {
            std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
        }
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
