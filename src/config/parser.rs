//! Configuration parser for loading engine configuration.
//!
//! Precedence, lowest first: built-in defaults, the YAML file, `.env`
//! entries, then `CONVERGE_*` environment variables.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{ConfigError, Result};
use crate::planner::FailurePolicy;

use super::settings::{EngineConfig, StateBackend};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "CONVERGE_";

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.config.yaml", "converge.config.yml"];

/// Configuration parser for loading engine configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let path = self.resolve(path.as_ref());
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound { path }.into());
        }

        let content = std::fs::read_to_string(&path).map_err(|e| ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })?;

        self.parse_yaml(&content, Some(&path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<EngineConfig> {
        debug!("Parsing YAML configuration");

        // An empty file deserializes to unit, not a map.
        if content.trim().is_empty() {
            return Ok(EngineConfig::default());
        }

        serde_yaml::from_str(content).map_err(|e| {
            ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            }
            .into()
        })
    }

    /// Loads configuration with `.env` and process environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        let mut config = self.load_file(path)?;
        self.load_dotenv()?;
        Self::apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Applies `CONVERGE_*` overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidEnvOverride` for unparsable values.
    pub fn apply_env_overrides<F>(config: &mut EngineConfig, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            let name = format!("{ENV_PREFIX}{key}");
            lookup(&name).map(|value| (name, value))
        };

        if let Some((name, value)) = var("PARALLELISM") {
            debug!("Overriding parallelism from environment");
            config.parallelism = parse_value(&name, &value)?;
        }

        if let Some((name, value)) = var("FAILURE_POLICY") {
            debug!("Overriding failure_policy from environment");
            config.failure_policy = match value.as_str() {
                "fail_fast" => FailurePolicy::FailFast,
                "best_effort" => FailurePolicy::BestEffort,
                _ => return Err(invalid(&name, &value)),
            };
        }

        if let Some((name, value)) = var("REFRESH_BEFORE_PLAN") {
            debug!("Overriding refresh_before_plan from environment");
            config.refresh_before_plan = parse_value(&name, &value)?;
        }

        if let Some((name, value)) = var("RETRY_MAX_ATTEMPTS") {
            debug!("Overriding retry.max_attempts from environment");
            config.retry.max_attempts = parse_value(&name, &value)?;
        }

        if let Some((name, value)) = var("RETRY_TOTAL_BUDGET_MS") {
            debug!("Overriding retry.total_budget_ms from environment");
            config.retry.total_budget_ms = parse_value(&name, &value)?;
        }

        if let Some((name, value)) = var("STATE_BACKEND") {
            debug!("Overriding state.backend from environment");
            config.state.backend = match value.as_str() {
                "local" => StateBackend::Local,
                "memory" => StateBackend::Memory,
                _ => return Err(invalid(&name, &value)),
            };
        }

        if let Some((_, value)) = var("STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(PathBuf::from(value));
        }

        if let Some((name, value)) = var("LOG_JSON") {
            config.logging.json = parse_value(&name, &value)?;
        }

        if let Some((name, value)) = var("VERBOSE") {
            config.logging.verbose = parse_value(&name, &value)?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self.resolve(Path::new(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }
}

fn parse_value<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| invalid(name, value))
}

fn invalid(name: &str, value: &str) -> crate::error::ConvergeError {
    ConfigError::InvalidEnvOverride {
        name: name.to_string(),
        value: value.to_string(),
    }
    .into()
}

/// Finds the configuration file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }
    .into())
}
