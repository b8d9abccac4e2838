//! Engine configuration validation.
//!
//! Collects every problem in one pass; hard errors fail validation,
//! warnings are logged by the caller.

use tracing::debug;

use crate::error::{ConfigError, Result};

use super::settings::{EngineConfig, RetryConfig, StateBackend, StateConfig};

/// Parallelism above which a warning is emitted.
const PARALLELISM_WARN_THRESHOLD: usize = 64;

/// Validator for engine configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ValidationResult {
    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates an engine configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, config: &EngineConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        if config.parallelism == 0 {
            result.error("parallelism", "Parallelism must be at least 1");
        } else if config.parallelism > PARALLELISM_WARN_THRESHOLD {
            result.warnings.push(format!(
                "parallelism: {} concurrent changes may trip remote rate limits",
                config.parallelism
            ));
        }

        Self::validate_retry(&config.retry, &mut result);
        Self::validate_state(&config.state, &mut result);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ConfigError::validation(first_error.message.clone(), first_error.field.clone()).into())
        }
    }

    fn validate_retry(retry: &RetryConfig, result: &mut ValidationResult) {
        if retry.max_attempts == 0 {
            result.error("retry.max_attempts", "At least one attempt is required");
        }

        if retry.initial_backoff_ms > retry.max_backoff_ms {
            result.error(
                "retry.initial_backoff_ms",
                format!(
                    "Initial backoff ({}ms) exceeds max backoff ({}ms)",
                    retry.initial_backoff_ms, retry.max_backoff_ms
                ),
            );
        }

        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            result.error(
                "retry.multiplier",
                format!("Backoff multiplier must be at least 1.0, got {}", retry.multiplier),
            );
        }

        if retry.total_budget_ms == 0 {
            result.error("retry.total_budget_ms", "Retry budget must be positive");
        } else if retry.max_attempts > 1 && retry.total_budget_ms < retry.initial_backoff_ms {
            result.warnings.push(String::from(
                "retry.total_budget_ms: budget is shorter than the first backoff; calls will not be retried",
            ));
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::Local => {
                if state.path.as_ref().is_some_and(|p| p.as_os_str().is_empty()) {
                    result.error("state.path", "State path cannot be empty");
                }
            }
            StateBackend::Memory => {
                if state.path.is_some() {
                    result
                        .warnings
                        .push(String::from("state.path is ignored by the memory backend"));
                }
                result
                    .warnings
                    .push(String::from("state.backend: memory state is lost when the process exits"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_config_is_valid() {
        let result = ConfigValidator::new().validate(&EngineConfig::default()).expect("valid");
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let config = EngineConfig {
            parallelism: 0,
            ..EngineConfig::default()
        };
        let err = ConfigValidator::new().validate(&config).expect_err("invalid");
        assert!(err.to_string().contains("Parallelism"));
    }

    #[test]
    fn test_all_retry_errors_collected() {
        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        config.retry.initial_backoff_ms = 60_000;
        config.retry.multiplier = 0.5;

        let mut result = ValidationResult::default();
        ConfigValidator::validate_retry(&config.retry, &mut result);

        let fields: Vec<_> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["retry.max_attempts", "retry.initial_backoff_ms", "retry.multiplier"]
        );
    }

    #[test]
    fn test_memory_backend_warns() {
        let config = EngineConfig {
            state: StateConfig {
                backend: StateBackend::Memory,
                path: Some(PathBuf::from("ignored.json")),
            },
            ..EngineConfig::default()
        };
        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert_eq!(result.warnings.len(), 2);
    }
}
