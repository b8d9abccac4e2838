//! Engine configuration types.
//!
//! These map to `converge.config.yaml`. Every field has a default, so an
//! empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::planner::{FailurePolicy, RetryPolicy, DEFAULT_PARALLELISM};
use crate::state::{LocalStateStore, MemoryStateStore, StateStore};

/// Root engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum number of changes applied concurrently.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// What to do after a change fails.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Retry policy for transient remote errors.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Re-read remote objects before planning.
    #[serde(default = "default_refresh_before_plan")]
    pub refresh_before_plan: bool,
    /// State backend.
    #[serde(default)]
    pub state: StateConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Retry settings, with durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First backoff delay.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff cap.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Growth factor between delays.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Wall-clock budget per remote call across all attempts.
    #[serde(default = "default_total_budget_ms")]
    pub total_budget_ms: u64,
    /// Randomize delays.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

/// State backend configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    /// Backend type.
    #[serde(default)]
    pub backend: StateBackend,
    /// State file for the local backend. Defaults to `.converge/state.json`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local JSON file.
    #[default]
    Local,
    /// Process memory; lost on exit.
    Memory,
}

/// Log output configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Enable debug-level logging.
    #[serde(default)]
    pub verbose: bool,
    /// Emit JSON lines instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            failure_policy: FailurePolicy::default(),
            retry: RetryConfig::default(),
            refresh_before_plan: default_refresh_before_plan(),
            state: StateConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            total_budget_ms: default_total_budget_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Builds the runtime retry policy.
    #[must_use]
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: self.multiplier,
            total_budget: Duration::from_millis(self.total_budget_ms),
            jitter: self.jitter,
        }
    }
}

impl StateConfig {
    /// Opens the configured store. Relative paths resolve against `base_dir`.
    #[must_use]
    pub fn open(&self, base_dir: &Path) -> Arc<dyn StateStore> {
        match self.backend {
            StateBackend::Memory => Arc::new(MemoryStateStore::new()),
            StateBackend::Local => match &self.path {
                Some(path) => Arc::new(LocalStateStore::with_state_path(base_dir.join(path))),
                None => Arc::new(LocalStateStore::with_base_dir(base_dir.join(".converge"))),
            },
        }
    }
}

const fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

const fn default_refresh_before_plan() -> bool {
    true
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_total_budget_ms() -> u64 {
    300_000
}

const fn default_jitter() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_runtime_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.parallelism, DEFAULT_PARALLELISM);
        assert_eq!(config.failure_policy, FailurePolicy::FailFast);
        assert_eq!(config.retry.to_policy(), RetryPolicy::default());
        assert!(config.refresh_before_plan);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config: EngineConfig = serde_yaml::from_str("{}").expect("parse");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<EngineConfig, _> = serde_yaml::from_str("paralelism: 3");
        assert!(result.is_err());
    }

    #[test]
    fn test_memory_backend_opens_memory_store() {
        let state = StateConfig {
            backend: StateBackend::Memory,
            path: None,
        };
        let store = state.open(Path::new("."));
        assert_eq!(store.backend_type(), "memory");
    }

    #[test]
    fn test_local_backend_resolves_relative_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = StateConfig {
            backend: StateBackend::Local,
            path: Some(PathBuf::from("states/prod.json")),
        };
        let store = state.open(dir.path());
        assert_eq!(store.backend_type(), "local");
    }
}
