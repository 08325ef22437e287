pub mod agent_core;
pub mod app;
pub mod config;
pub mod inference;
pub mod mcp_client;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};

pub use app::{AppError, AppServices, AppStatus, ChatApp};
pub use config::AppConfig;

/// Log file name inside the data directory.
pub const LOG_FILE_NAME: &str = "client.log";

/// Return the platform-standard data directory for the client.
///
/// - macOS: `~/Library/Application Support/mcp-llm-client/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-llm-client\`
/// - Linux: `$XDG_DATA_HOME/mcp-llm-client/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-llm-client/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-llm-client");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-llm-client")
}

/// Initialize the tracing subscriber, writing structured logs under `log_dir`.
///
/// On each start:
/// 1. Rotates existing logs (client.log → client.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh client.log with a line-flushing writer.
/// 3. Logs a startup banner with the data directory path.
pub fn init_tracing(log_dir: &Path) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    std::fs::create_dir_all(log_dir)?;
    let log_path = log_dir.join(LOG_FILE_NAME);

    rotate_log_file(&log_path, 3);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_llm_client=info,warn"));

    let installed = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init();
    if let Err(e) = installed {
        return Err(std::io::Error::other(format!(
            "tracing subscriber already set: {e}"
        )));
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== MCP LLM Client starting ==="
    );
    Ok(log_path)
}

/// Rotate log files: `client.log` → `client.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Each log line is on disk as soon as it is written, so a crash never
/// loses the lines leading up to it.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
