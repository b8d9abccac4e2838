//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Every mutation is guarded by an expected version and bumps the store
//! version, which is how stale plans and concurrent writers are detected.

use async_trait::async_trait;

use crate::error::Result;
use super::types::{RemoteStateRecord, ResourceAddress, StateSnapshot};

/// Trait for versioned state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Gets the record for an address.
    ///
    /// Returns `None` if nothing is recorded.
    async fn get(&self, address: &ResourceAddress) -> Result<Option<RemoteStateRecord>>;

    /// Writes a record.
    ///
    /// `expected_version` is the version of the record currently stored, or
    /// `None` when the address must not be recorded yet. Returns the record
    /// as persisted, carrying its new version.
    ///
    /// # Errors
    ///
    /// Returns `StateError::VersionConflict` if the expectation is stale.
    async fn put(
        &self,
        record: RemoteStateRecord,
        expected_version: Option<u64>,
    ) -> Result<RemoteStateRecord>;

    /// Deletes the record for an address.
    ///
    /// # Errors
    ///
    /// Returns `StateError::VersionConflict` if the record is absent or its
    /// version differs from `expected_version`.
    async fn delete(&self, address: &ResourceAddress, expected_version: u64) -> Result<()>;

    /// Takes a read-only snapshot of every record.
    async fn snapshot(&self) -> Result<StateSnapshot>;

    /// Gets the current store version.
    async fn version(&self) -> Result<u64>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}
