//! Apply outcomes and reports.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{ApplyError, ErrorKind, Result};
use crate::state::{RemoteStateRecord, ResourceAddress};

use super::plan::ChangeAction;

/// Outcome of applying one change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ApplyOutcome {
    /// The change took effect; the record as persisted (the last known
    /// record for destroys).
    Success {
        /// Resulting record.
        record: RemoteStateRecord,
    },
    /// The change failed.
    Failure {
        /// Error classification.
        kind: ErrorKind,
        /// Error description.
        message: String,
    },
    /// The change was never attempted.
    Skipped {
        /// Why it was skipped.
        reason: String,
    },
}

/// Outcome of one plan node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    /// Address of the resource.
    pub address: ResourceAddress,
    /// Planned action.
    pub action: ChangeAction,
    /// What happened.
    pub outcome: ApplyOutcome,
    /// Remote call attempts, retries included.
    pub attempts: u32,
    /// Wall-clock time spent on the node in milliseconds.
    pub duration_ms: u64,
}

/// Result of applying a plan.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    /// Plan that was applied.
    pub plan_id: Uuid,
    /// When apply started.
    pub started_at: DateTime<Utc>,
    /// When apply finished.
    pub finished_at: DateTime<Utc>,
    /// Every node's outcome, in plan order.
    pub outcomes: Vec<NodeOutcome>,
    /// Whether cancellation was observed.
    pub cancelled: bool,
    /// Store version after apply.
    pub final_version: u64,
}

impl ApplyOutcome {
    /// Returns true for `Success`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Returns true for `Failure`.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure { .. })
    }

    /// Returns true for `Skipped`.
    #[must_use]
    pub const fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    /// Creates a skipped outcome.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            reason: reason.into(),
        }
    }

    /// Gets the resulting record of a success.
    #[must_use]
    pub const fn record(&self) -> Option<&RemoteStateRecord> {
        match self {
            Self::Success { record } => Some(record),
            Self::Failure { .. } | Self::Skipped { .. } => None,
        }
    }
}

impl NodeOutcome {
    /// Creates an outcome for a node that made no remote calls.
    #[must_use]
    pub const fn immediate(address: ResourceAddress, action: ChangeAction, outcome: ApplyOutcome) -> Self {
        Self {
            address,
            action,
            outcome,
            attempts: 0,
            duration_ms: 0,
        }
    }
}

impl ApplyReport {
    /// Number of successful nodes, no-ops included.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.outcome.is_success()).count()
    }

    /// Number of failed nodes.
    #[must_use]
    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.outcome.is_failure()).count()
    }

    /// Number of skipped nodes.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|o| o.outcome.is_skipped()).count()
    }

    /// Returns true if every node succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.outcome.is_success())
    }

    /// Gets the outcome for an address.
    #[must_use]
    pub fn outcome(&self, address: &ResourceAddress) -> Option<&NodeOutcome> {
        self.outcomes.iter().find(|o| &o.address == address)
    }

    /// Failed nodes.
    pub fn failures(&self) -> impl Iterator<Item = &NodeOutcome> {
        self.outcomes.iter().filter(|o| o.outcome.is_failure())
    }

    /// Converts the first failure into an error.
    ///
    /// # Errors
    ///
    /// Returns `ApplyError::NodeFailed` if any node failed.
    pub fn ensure_success(&self) -> Result<()> {
        match self.failures().next() {
            None => Ok(()),
            Some(failed) => Err(ApplyError::NodeFailed {
                address: failed.address.to_string(),
                action: failed.action.to_string(),
                message: failed.outcome.to_string(),
            }
            .into()),
        }
    }
}

impl std::fmt::Display for ApplyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success { record } => write!(f, "success ({})", record.remote_id),
            Self::Failure { kind, message } => write!(f, "failure [{kind}]: {message}"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

impl std::fmt::Display for ApplyReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Applied {} changes: {} successful, {} failed, {} skipped",
            self.outcomes.len(),
            self.succeeded(),
            self.failed(),
            self.skipped()
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}
