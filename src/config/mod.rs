//! Engine configuration.
//!
//! - Parsing `converge.config.yaml` with environment overrides
//! - Validation of configuration values

mod parser;
mod settings;
mod validator;

pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES, ENV_PREFIX};
pub use settings::{EngineConfig, LoggingConfig, RetryConfig, StateBackend, StateConfig};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
