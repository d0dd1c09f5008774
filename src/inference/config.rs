//! Service configuration loading and validation.
//!
//! Reads `config/agrodesk.yaml` and resolves environment variables.
//! Config is the single source of truth for upstream endpoints, retry policy,
//! session limits and the decision thresholds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::UpstreamError;
use crate::agent_core::types::CatalogEntry;

/// Env var that points directly at a config file.
pub const CONFIG_ENV_VAR: &str = "AGRODESK_CONFIG";

/// Relative location searched for when walking up from the working directory.
const CONFIG_RELATIVE_PATH: &str = "config/agrodesk.yaml";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration (mirrors `config/agrodesk.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DeskConfig {
    pub server: ServerConfig,
    pub classification: ClassificationConfig,
    pub search: SearchConfig,
    pub automation: AutomationConfig,
    pub sessions: SessionConfig,
    pub policy: PolicyConfig,
    pub logging: LoggingConfig,
    /// Replaces the built-in runbook catalog when present.
    pub catalog: Option<Vec<CatalogEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Retry policy shared by the classification and search adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Per-attempt deadline.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(retry.saturating_sub(1))
    }
}

/// Text classification service (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassificationConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.0,
            timeout_secs: 10,
            max_retries: 2,
            retry_base_delay_ms: 500,
        }
    }
}

impl ClassificationConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

/// Search index service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub index: String,
    /// Sources cited in a synthesized answer.
    pub top_k: usize,
    /// Documents requested from the index before filtering.
    pub candidates: usize,
    pub min_relevance_score: f32,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9200".to_string(),
            api_key: None,
            index: "agro-knowledge".to_string(),
            top_k: 3,
            candidates: 5,
            min_relevance_score: 0.3,
            timeout_secs: 10,
            max_retries: 2,
            retry_base_delay_ms: 500,
        }
    }
}

impl SearchConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

/// Automation execution service. With no `base_url` runbooks are only logged.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_secs: 15,
        }
    }
}

/// Where session state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionBackendKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
    pub capacity: usize,
    /// Turns allowed to wait behind the in-flight one before `SessionBusy`.
    pub max_queued_turns: usize,
    pub eviction_interval_secs: u64,
    pub backend: SessionBackendKind,
    /// SQLite file; defaults to `agrodesk.db` in the data directory.
    pub database_path: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 1800,
            capacity: 10_000,
            max_queued_turns: 4,
            eviction_interval_secs: 60,
            backend: SessionBackendKind::Memory,
            database_path: None,
        }
    }
}

/// Decision and merge thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub auto_execute_threshold: f32,
    /// New field values must beat the stored confidence by more than this.
    pub merge_confidence_margin: f32,
    /// Subtracted from classifier confidence when retrieval found nothing.
    pub no_knowledge_penalty: f32,
    pub turn_timeout_secs: u64,
    pub max_message_chars: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            auto_execute_threshold: 0.8,
            merge_confidence_margin: 0.1,
            no_knowledge_penalty: 0.1,
            turn_timeout_secs: 60,
            max_message_chars: 4000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// Write to `agrodesk.log` in the data directory instead of stdout.
    pub file: bool,
    pub keep_rotations: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            file: false,
            keep_rotations: 3,
        }
    }
}

impl DeskConfig {
    /// Reject values that would make the pipeline misbehave silently.
    pub fn validate(&self) -> Result<(), UpstreamError> {
        let unit = |name: &str, v: f32| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(UpstreamError::ConfigError {
                    reason: format!("{name} must be within [0, 1], got {v}"),
                })
            }
        };
        unit("policy.auto_execute_threshold", self.policy.auto_execute_threshold)?;
        unit("policy.merge_confidence_margin", self.policy.merge_confidence_margin)?;
        unit("policy.no_knowledge_penalty", self.policy.no_knowledge_penalty)?;
        unit("search.min_relevance_score", self.search.min_relevance_score)?;

        if self.search.top_k == 0 {
            return Err(UpstreamError::ConfigError {
                reason: "search.top_k must be at least 1".into(),
            });
        }
        if self.search.candidates < self.search.top_k {
            return Err(UpstreamError::ConfigError {
                reason: format!(
                    "search.candidates ({}) must be >= search.top_k ({})",
                    self.search.candidates, self.search.top_k
                ),
            });
        }
        if self.sessions.capacity == 0 {
            return Err(UpstreamError::ConfigError {
                reason: "sessions.capacity must be at least 1".into(),
            });
        }
        if self.policy.turn_timeout_secs == 0 {
            return Err(UpstreamError::ConfigError {
                reason: "policy.turn_timeout_secs must be at least 1".into(),
            });
        }
        if self.policy.max_message_chars == 0 {
            return Err(UpstreamError::ConfigError {
                reason: "policy.max_message_chars must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Checks `AGRODESK_CONFIG` first, then searches upward from `start` for
/// `config/agrodesk.yaml`. Returns `None` when nothing is found; callers fall
/// back to built-in defaults.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    if let Ok(explicit) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(expand_tilde(&explicit));
        if candidate.exists() {
            return Some(candidate);
        }
        tracing::warn!(path = %candidate.display(), "AGRODESK_CONFIG points at a missing file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_RELATIVE_PATH);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

/// Load, interpolate, parse and validate a config file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<DeskConfig, UpstreamError> {
    let raw = std::fs::read_to_string(path).map_err(|e| UpstreamError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;
    parse_config(&raw)
}

/// Parse config text (after env interpolation) and validate it.
pub fn parse_config(raw: &str) -> Result<DeskConfig, UpstreamError> {
    let interpolated = interpolate_env_vars(raw);
    let config: DeskConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| UpstreamError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;
    config.validate()?;
    Ok(config)
}

/// Resolve and load the config, or defaults when no file exists.
pub fn load_or_default(start: &Path) -> Result<(DeskConfig, Option<PathBuf>), UpstreamError> {
    match find_config_path(start) {
        Some(path) => Ok((load_config(&path)?, Some(path))),
        None => Ok((DeskConfig::default(), None)),
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

/// Resolve `VAR` or `VAR:-default`. Empty values count as unset.
fn resolve_var_expr(expr: &str) -> String {
    match expr.split_once(":-") {
        Some((name, default)) => match std::env::var(name) {
            Ok(v) if !v.is_empty() => v,
            _ => expand_tilde(default),
        },
        None => std::env::var(expr).unwrap_or_default(),
    }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__AGRODESK_TEST_UNSET__");
        let result = interpolate_env_vars("key: ${__AGRODESK_TEST_UNSET__:-fallback}");
        assert_eq!(result, "key: fallback");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__AGRODESK_TEST_SET__", "sk-live");
        let result = interpolate_env_vars("${__AGRODESK_TEST_SET__:-none}");
        assert_eq!(result, "sk-live");
        std::env::remove_var("__AGRODESK_TEST_SET__");
    }

    #[test]
    fn test_expand_tilde() {
        let result = expand_tilde("~/agrodesk.db");
        assert!(!result.starts_with('~'));
        assert!(result.ends_with("/agrodesk.db"));
    }

    #[test]
    fn test_empty_yaml_gives_defaults() {
        let config = parse_config("{}").unwrap();
        assert_eq!(config.search.top_k, 3);
        assert_eq!(config.classification.max_retries, 2);
        assert_eq!(config.sessions.backend, SessionBackendKind::Memory);
        assert!((config.policy.auto_execute_threshold - 0.8).abs() < f32::EPSILON);
        assert!(config.catalog.is_none());
    }

    #[test]
    fn test_shipped_config_parses() {
        let config = parse_config(include_str!("../../config/agrodesk.yaml")).unwrap();
        assert_eq!(config.search.index, "agro-knowledge");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.automation.base_url.is_none());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let yaml = r#"
            search:
              top_k: 2
            sessions:
              backend: sqlite
              database_path: ":memory:"
        "#;
        let config = parse_config(yaml).unwrap();
        assert_eq!(config.search.top_k, 2);
        assert_eq!(config.search.candidates, 5);
        assert_eq!(config.sessions.backend, SessionBackendKind::Sqlite);
        assert_eq!(config.sessions.ttl_secs, 1800);
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let err = parse_config("policy:\n  auto_execute_threshold: 1.5\n").unwrap_err();
        assert!(err.to_string().contains("auto_execute_threshold"));
    }

    #[test]
    fn test_candidates_below_top_k_rejected() {
        let err = parse_config("search:\n  top_k: 6\n  candidates: 2\n").unwrap_err();
        assert!(matches!(err, UpstreamError::ConfigError { .. }));
    }

    #[test]
    fn test_zero_turn_limits_rejected() {
        let err = parse_config("policy:\n  turn_timeout_secs: 0\n").unwrap_err();
        assert!(err.to_string().contains("turn_timeout_secs"));
        let err = parse_config("policy:\n  max_message_chars: 0\n").unwrap_err();
        assert!(err.to_string().contains("max_message_chars"));
    }

    #[test]
    fn test_retry_policy_backoff_doubles() {
        let policy = ClassificationConfig::default().retry_policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
        assert_eq!(policy.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_find_config_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::write(dir.path().join("config/agrodesk.yaml"), "{}").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        std::env::remove_var(CONFIG_ENV_VAR);
        let found = find_config_path(&nested).unwrap();
        assert!(found.ends_with("config/agrodesk.yaml"));
    }
}
