pub mod agent_core;
pub mod commands;
pub mod inference;
pub mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agent_core::{
    Catalog, DecisionEngine, DecisionPolicy, DeskError, InMemoryBackend, IntentClassifier,
    KnowledgeRetriever, Orchestrator, OrchestratorPolicy, RetrievalSettings, SessionBackend,
    SessionStore, SqliteSessionBackend, StoreSettings,
};
use inference::config::{LogFormat, LoggingConfig, SessionBackendKind};
use inference::{DeskConfig, HttpClassificationService, HttpSearchIndex};

/// Shared state behind every command.
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub config: DeskConfig,
}

impl AppState {
    /// Wire the store, upstream adapters and pipeline steps from config.
    pub fn from_config(config: DeskConfig) -> Result<Self, DeskError> {
        config.validate()?;

        let catalog = match &config.catalog {
            Some(entries) => Catalog::new(entries.clone())?,
            None => Catalog::builtin(),
        };

        let backend: Arc<dyn SessionBackend> = match config.sessions.backend {
            SessionBackendKind::Memory => Arc::new(InMemoryBackend::new()),
            SessionBackendKind::Sqlite => {
                let path = resolve_db_path(config.sessions.database_path.as_deref());
                Arc::new(SqliteSessionBackend::open(&path)?)
            }
        };
        let store = Arc::new(SessionStore::new(backend, StoreSettings::from(&config.sessions)));

        let classifier = IntentClassifier::new(
            Arc::new(HttpClassificationService::from_config(config.classification.clone())?),
            config.classification.retry_policy(),
        );
        let retriever = KnowledgeRetriever::new(
            Arc::new(HttpSearchIndex::from_config(config.search.clone())?),
            config.search.retry_policy(),
            RetrievalSettings {
                top_k: config.search.top_k,
                candidates: config.search.candidates,
                min_relevance_score: config.search.min_relevance_score,
            },
        );
        let engine = DecisionEngine::new(
            Arc::new(catalog),
            DecisionPolicy {
                auto_execute_threshold: config.policy.auto_execute_threshold,
                no_knowledge_penalty: config.policy.no_knowledge_penalty,
            },
        );
        let automation = Arc::from(inference::automation::from_config(&config.automation)?);

        let orchestrator = Orchestrator::new(
            store,
            classifier,
            retriever,
            engine,
            automation,
            OrchestratorPolicy::from(&config.policy),
        );

        Ok(Self {
            orchestrator,
            config,
        })
    }
}

/// Periodically evict idle sessions until the runtime shuts down.
pub fn spawn_eviction(state: Arc<AppState>) -> tokio::task::JoinHandle<()> {
    let period = Duration::from_secs(state.config.sessions.eviction_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = state.orchestrator.store().evict(chrono::Utc::now()) {
                tracing::warn!(error = %e, "session eviction failed");
            }
        }
    })
}

/// Return the platform-standard data directory for AgroDesk.
///
/// - macOS: `~/Library/Application Support/agrodesk/`
/// - Linux: `$XDG_DATA_HOME/agrodesk/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.agrodesk/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("agrodesk");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".agrodesk")
}

/// Resolve the path for the session database, creating its directory.
fn resolve_db_path(configured: Option<&str>) -> String {
    let path = match configured {
        Some(p) if !p.trim().is_empty() => PathBuf::from(inference::config::expand_tilde(p)),
        _ => data_dir().join("agrodesk.db"),
    };
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    path.to_string_lossy().into_owned()
}

// ─── Tracing ────────────────────────────────────────────────────────────────

/// Initialize the tracing subscriber.
///
/// With file logging enabled:
/// 1. Rotates existing logs (agrodesk.log → agrodesk.log.1 → … → .keep).
/// 2. Opens a fresh agrodesk.log with a line-flushing writer.
///
/// Returns the log file path when logging to a file.
pub fn init_tracing(config: &LoggingConfig) -> Result<Option<PathBuf>, DeskError> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::EnvFilter;

    let (writer, log_path) = if config.file {
        let log_dir = data_dir();
        let _ = std::fs::create_dir_all(&log_dir);
        let log_path = log_dir.join("agrodesk.log");

        rotate_log_file(&log_path, config.keep_rotations);

        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| DeskError::Config {
                reason: format!("failed to open {}: {e}", log_path.display()),
            })?;
        (BoxMakeWriter::new(FlushingWriter::new(log_file)), Some(log_path))
    } else {
        (BoxMakeWriter::new(std::io::stdout), None)
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("agrodesk=info,tower_http=info,warn"));

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(log_path.is_none())
        .with_target(true)
        .with_thread_ids(false);

    let installed = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| DeskError::Config {
        reason: format!("failed to install tracing subscriber: {e}"),
    })?;

    Ok(log_path)
}

/// Rotate log files: `agrodesk.log` → `agrodesk.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

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

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// each log line reaches the disk even if the process dies.
#[derive(Clone)]
struct FlushingWriter {
    file: Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: Arc::new(std::sync::Mutex::new(file)),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotate_log_file_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("agrodesk.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("agrodesk.log.1"), "one").unwrap();
        std::fs::write(dir.path().join("agrodesk.log.2"), "two").unwrap();

        rotate_log_file(&base, 2);

        assert!(!base.exists());
        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("agrodesk.log.1"), "current");
        assert_eq!(read("agrodesk.log.2"), "one");
    }

    #[test]
    fn test_app_state_with_sqlite_backend() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = DeskConfig::default();
        config.sessions.backend = SessionBackendKind::Sqlite;
        config.sessions.database_path = Some(dir.path().join("desk.db").to_string_lossy().into_owned());

        let state = AppState::from_config(config).unwrap();
        let id = state.orchestrator.store().create_session().unwrap();
        assert!(state.orchestrator.store().get(id).is_ok());
        assert!(dir.path().join("desk.db").exists());
    }

    #[test]
    fn test_app_state_rejects_duplicate_catalog_ids() {
        let mut config = DeskConfig::default();
        let entry = Catalog::builtin().entries()[0].clone();
        config.catalog = Some(vec![entry.clone(), entry]);
        assert!(matches!(
            AppState::from_config(config),
            Err(DeskError::Config { .. })
        ));
    }
}
