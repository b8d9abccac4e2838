//! Rendering of plans, apply reports and drift for people and machines.

mod output;

use serde::{Deserialize, Serialize};

pub use output::OutputFormatter;

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable text with tables.
    #[default]
    Text,
    /// Pretty-printed JSON.
    Json,
}
