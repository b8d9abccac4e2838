//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ConvergeError, Result};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` wins when set; otherwise the level is `debug` if `verbose`,
/// else `info`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn init_tracing(verbose: bool, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| ConvergeError::internal(format!("Failed to install tracing subscriber: {e}")))
}

/// Installs the subscriber described by the logging configuration.
///
/// # Errors
///
/// Same as [`init_tracing`].
pub fn init_from_config(logging: &LoggingConfig) -> Result<()> {
    init_tracing(logging.verbose, logging.json)
}

fn default_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_fails() {
        let _ = init_tracing(false, false);
        assert!(init_tracing(true, true).is_err());
    }

    #[test]
    fn test_default_filter_levels() {
        assert_eq!(default_filter(true).to_string(), "debug");
        assert_eq!(default_filter(false).to_string(), "info");
    }
}
