//! Error types for the converge reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a
//! reconciliation: configuration, graph construction, planning, state
//! management, remote operations, apply and verification.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

/// The main error type for the reconciliation engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Desired-state document and dependency graph errors.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Remote API errors.
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Apply errors.
    #[error("Apply error: {0}")]
    Apply(#[from] ApplyError),

    /// Verification errors.
    #[error("Verification failed: {0}")]
    Verify(#[from] VerifyError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// An environment override could not be applied.
    #[error("Invalid value for {name}: {value}")]
    InvalidEnvOverride {
        /// Name of the variable.
        name: String,
        /// The rejected value.
        value: String,
    },
}

/// Desired-state document and dependency graph errors.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The document could not be parsed.
    #[error("Failed to parse desired-state document: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// A resource address is malformed.
    #[error("Invalid resource address '{address}': {reason}")]
    InvalidAddress {
        /// The offending address text.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The resource type has no registered descriptor.
    #[error("Unknown resource type '{resource_type}' for {address}")]
    UnknownResourceType {
        /// Address of the declaring node.
        address: String,
        /// The unregistered type.
        resource_type: String,
    },

    /// The same address was declared twice.
    #[error("Duplicate resource address: {address}")]
    DuplicateAddress {
        /// The duplicated address.
        address: String,
    },

    /// An attribute failed schema validation.
    #[error("Invalid attribute {address}.{attribute}: {message}")]
    InvalidAttribute {
        /// Address of the declaring node.
        address: String,
        /// Attribute name.
        attribute: String,
        /// Description of the problem.
        message: String,
    },

    /// A reference does not resolve to a declared computed attribute.
    #[error("Unresolved reference '{reference}' in {address}: {reason}")]
    UnresolvedReference {
        /// Address of the referencing node.
        address: String,
        /// The reference text.
        reference: String,
        /// Why it could not be resolved.
        reason: String,
    },

    /// The references form a cycle.
    #[error("Dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected {
        /// Node sequence of the cycle; first and last entries are equal.
        cycle: Vec<String>,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// The expected record version did not match the stored one.
    #[error("Version conflict on {address}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        /// Address being written.
        address: String,
        /// Version the writer expected (`None` = absent).
        expected: Option<u64>,
        /// Version actually stored (`None` = absent).
        found: Option<u64>,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// Backend storage error.
    #[error("State storage error: {message}")]
    StorageError {
        /// Description of the storage error.
        message: String,
    },

    /// State file format version mismatch.
    #[error("State format mismatch: expected {expected}, found {found}")]
    FormatMismatch {
        /// Supported format version.
        expected: String,
        /// Found format version.
        found: String,
    },
}

/// Errors returned by remote resource operations.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// Throttling, propagation delay or another condition worth retrying.
    #[error("Transient remote error: {message}")]
    Transient {
        /// Description from the remote API.
        message: String,
        /// Server-suggested delay before retrying.
        retry_after: Option<Duration>,
    },

    /// A failure that retrying will not fix.
    #[error("Permanent remote error: {message}")]
    Permanent {
        /// Description from the remote API.
        message: String,
    },

    /// The remote object does not exist.
    #[error("Remote object not found: {address} ({remote_id})")]
    NotFound {
        /// Address of the resource.
        address: String,
        /// Remote identifier that was looked up.
        remote_id: String,
    },

    /// The call observed cancellation and returned early.
    #[error("Remote call cancelled")]
    Cancelled,
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The store changed after the plan's snapshot was taken.
    #[error("Plan is stale: planned against version {planned}, store is at {current}")]
    PlanStale {
        /// Store version the plan was built from.
        planned: u64,
        /// Store version at apply time.
        current: u64,
    },

    /// A recorded resource has a type with no registered descriptor.
    #[error("Unknown resource type '{resource_type}' recorded for {address}")]
    UnknownResourceType {
        /// Recorded address.
        address: String,
        /// The unregistered type.
        resource_type: String,
    },

    /// A record was written by a newer schema than the registry knows.
    #[error("Record {address} has schema version {recorded}, newest supported is {supported}")]
    SchemaVersionAhead {
        /// Recorded address.
        address: String,
        /// Schema version in the record.
        recorded: u32,
        /// Schema version in the registry.
        supported: u32,
    },

    /// Recorded dependencies form a cycle, so destroy order is undefined.
    #[error("Recorded dependencies form a cycle involving: {}", .members.join(", "))]
    RecordedCycle {
        /// Addresses left unordered.
        members: Vec<String>,
    },
}

/// Apply errors.
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Import targeted an address that is already recorded.
    #[error("{address} is already managed as {remote_id}")]
    AlreadyManaged {
        /// Address requested.
        address: String,
        /// Remote identifier already recorded.
        remote_id: String,
    },

    /// A node failed; carried in reports, not returned from `apply`.
    #[error("Failed to apply {action} on {address}: {message}")]
    NodeFailed {
        /// Address of the node.
        address: String,
        /// Action that was attempted.
        action: String,
        /// Failure description.
        message: String,
    },
}

/// Verification errors.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The resource has no record in the state store.
    #[error("{address} is not recorded in state")]
    NotInState {
        /// Address checked.
        address: String,
    },

    /// An attribute differs from the expectation.
    #[error("{address}.{attribute}: expected {expected}, got {actual}")]
    AttributeMismatch {
        /// Address checked.
        address: String,
        /// Attribute compared.
        attribute: String,
        /// Expected JSON value.
        expected: String,
        /// Observed JSON value.
        actual: String,
    },

    /// The remote object still exists after destroy.
    #[error("{address} still exists remotely ({remote_id})")]
    StillExists {
        /// Address checked.
        address: String,
        /// Remote identifier that answered.
        remote_id: String,
    },

    /// The resource is still recorded after destroy.
    #[error("{address} is still recorded in state")]
    StillRecorded {
        /// Address checked.
        address: String,
    },

    /// The remote object vanished while it was expected to exist.
    #[error("{address} does not exist remotely ({remote_id})")]
    Missing {
        /// Address checked.
        address: String,
        /// Remote identifier that was looked up.
        remote_id: String,
    },
}

/// Coarse classification used in per-node apply outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transient remote error that exhausted its retry budget.
    TransientRemote,
    /// Permanent remote error.
    PermanentRemote,
    /// Remote object missing where it was required.
    NotFound,
    /// Optimistic-concurrency conflict in the state store.
    VersionConflict,
    /// A dependency's record was missing at apply time.
    UnresolvedReference,
    /// Any other state-store failure.
    State,
    /// The remote call was cancelled.
    Cancelled,
    /// Anything else.
    Internal,
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Remote(RemoteError::Transient { .. }) | Self::State(StateError::LockFailed { .. })
        )
    }

    /// Returns true if this error reports a missing remote object.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::Remote(RemoteError::NotFound { .. }))
    }

    /// Returns the suggested retry delay, if applicable.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Remote(RemoteError::Transient { retry_after, .. }) => *retry_after,
            Self::State(StateError::LockFailed { .. }) => Some(Duration::from_secs(2)),
            _ => None,
        }
    }

    /// Classifies the error for apply reports.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Remote(RemoteError::Transient { .. }) => ErrorKind::TransientRemote,
            Self::Remote(RemoteError::Permanent { .. }) => ErrorKind::PermanentRemote,
            Self::Remote(RemoteError::NotFound { .. }) => ErrorKind::NotFound,
            Self::Remote(RemoteError::Cancelled) => ErrorKind::Cancelled,
            Self::State(StateError::VersionConflict { .. }) => ErrorKind::VersionConflict,
            Self::Graph(GraphError::UnresolvedReference { .. }) => ErrorKind::UnresolvedReference,
            Self::State(_) => ErrorKind::State,
            _ => ErrorKind::Internal,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl GraphError {
    /// Creates an attribute validation error.
    #[must_use]
    pub fn attribute(
        address: impl Into<String>,
        attribute: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidAttribute {
            address: address.into(),
            attribute: attribute.into(),
            message: message.into(),
        }
    }
}

impl StateError {
    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::StorageError {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }
}

impl RemoteError {
    /// Creates a transient error without a retry hint.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::TransientRemote => "transient_remote",
            Self::PermanentRemote => "permanent_remote",
            Self::NotFound => "not_found",
            Self::VersionConflict => "version_conflict",
            Self::UnresolvedReference => "unresolved_reference",
            Self::State => "state",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        write!(f, "{kind}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let transient = ConvergeError::from(RemoteError::transient("throttled"));
        let permanent = ConvergeError::from(RemoteError::permanent("bad request"));

        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert_eq!(transient.kind(), ErrorKind::TransientRemote);
        assert_eq!(permanent.kind(), ErrorKind::PermanentRemote);
    }

    #[test]
    fn test_cycle_display_names_sequence() {
        let err = GraphError::CycleDetected {
            cycle: vec!["a.x".into(), "b.y".into(), "a.x".into()],
        };
        assert_eq!(err.to_string(), "Dependency cycle detected: a.x -> b.y -> a.x");
    }

    #[test]
    fn test_retry_after_hint() {
        let err = ConvergeError::from(RemoteError::Transient {
            message: String::from("slow down"),
            retry_after: Some(Duration::from_millis(250)),
        });
        assert_eq!(err.retry_after(), Some(Duration::from_millis(250)));
    }
}
