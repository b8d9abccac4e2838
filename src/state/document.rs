//! The persisted state document.
//!
//! Both backends hold one of these: the memory store in a lock, the local
//! store as a JSON file. Version checks live here so the backends agree on
//! optimistic-concurrency semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::StateError;

use super::types::{RemoteStateRecord, ResourceAddress, StateSnapshot};

/// Current version of the state format.
pub const STATE_FORMAT_VERSION: &str = "1";

/// The complete persisted state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDocument {
    /// State format version.
    pub format_version: String,
    /// Unique identity of this state, stable across writes.
    pub lineage: Uuid,
    /// Store version; incremented by every mutation.
    pub serial: u64,
    /// Records keyed by address.
    pub records: BTreeMap<ResourceAddress, RemoteStateRecord>,
    /// When the document was last mutated.
    pub last_updated: DateTime<Utc>,
}

impl StateDocument {
    /// Creates a new empty document.
    #[must_use]
    pub fn new() -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION.to_string(),
            lineage: Uuid::new_v4(),
            serial: 0,
            records: BTreeMap::new(),
            last_updated: Utc::now(),
        }
    }

    /// Writes a record if `expected_version` matches the stored one.
    ///
    /// # Errors
    ///
    /// Returns `StateError::VersionConflict` on a stale expectation.
    pub fn put(
        &mut self,
        mut record: RemoteStateRecord,
        expected_version: Option<u64>,
    ) -> Result<RemoteStateRecord, StateError> {
        let found = self.records.get(&record.address).map(|r| r.version);
        if found != expected_version {
            return Err(StateError::VersionConflict {
                address: record.address.to_string(),
                expected: expected_version,
                found,
            });
        }

        self.serial += 1;
        record.version = self.serial;
        self.records.insert(record.address.clone(), record.clone());
        self.last_updated = Utc::now();

        Ok(record)
    }

    /// Removes a record if `expected_version` matches the stored one.
    ///
    /// # Errors
    ///
    /// Returns `StateError::VersionConflict` if the record is absent or stale.
    pub fn delete(
        &mut self,
        address: &ResourceAddress,
        expected_version: u64,
    ) -> Result<RemoteStateRecord, StateError> {
        let found = self.records.get(address).map(|r| r.version);
        if found != Some(expected_version) {
            return Err(StateError::VersionConflict {
                address: address.to_string(),
                expected: Some(expected_version),
                found,
            });
        }

        self.serial += 1;
        self.last_updated = Utc::now();

        self.records.remove(address).ok_or_else(|| StateError::Corrupted {
            message: format!("record {address} vanished during delete"),
        })
    }

    /// Takes a read-only snapshot.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            version: self.serial,
            records: self.records.clone(),
        }
    }

    /// Checks that the document was written in a supported format.
    ///
    /// # Errors
    ///
    /// Returns `StateError::FormatMismatch` for unknown format versions.
    pub fn check_format(&self) -> Result<(), StateError> {
        if self.format_version == STATE_FORMAT_VERSION {
            Ok(())
        } else {
            Err(StateError::FormatMismatch {
                expected: STATE_FORMAT_VERSION.to_string(),
                found: self.format_version.clone(),
            })
        }
    }
}

impl Default for StateDocument {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::AttributeMap;

    fn record(name: &str) -> RemoteStateRecord {
        let address = ResourceAddress::new("kx_environment", name).expect("valid address");
        RemoteStateRecord::new(address, "remote", AttributeMap::new(), 1)
    }

    #[test]
    fn test_every_mutation_bumps_serial() {
        let mut document = StateDocument::new();

        let a = document.put(record("a"), None).expect("put a");
        let b = document.put(record("b"), None).expect("put b");
        assert_eq!((a.version, b.version), (1, 2));

        document.delete(&a.address, a.version).expect("delete a");
        assert_eq!(document.serial, 3);
        assert_eq!(document.snapshot().len(), 1);
    }

    #[test]
    fn test_conflict_reports_found_version() {
        let mut document = StateDocument::new();
        let a = document.put(record("a"), None).expect("put a");

        let err = document.put(record("a"), None).expect_err("must conflict");
        assert!(matches!(
            err,
            StateError::VersionConflict { expected: None, found: Some(v), .. } if v == a.version
        ));
    }

    #[test]
    fn test_unknown_format_rejected() {
        let mut document = StateDocument::new();
        document.format_version = String::from("99");
        assert!(document.check_format().is_err());
    }
}
