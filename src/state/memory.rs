//! In-memory state storage backend.
//!
//! Used for tests, dry runs and embedding the engine in a process that
//! persists state elsewhere.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::Result;

use super::document::StateDocument;
use super::store::StateStore;
use super::types::{RemoteStateRecord, ResourceAddress, StateSnapshot};

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    /// Current document, guarded for concurrent apply tasks.
    document: RwLock<StateDocument>,
}

impl MemoryStateStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded with an existing document.
    #[must_use]
    pub fn with_document(document: StateDocument) -> Self {
        Self {
            document: RwLock::new(document),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, address: &ResourceAddress) -> Result<Option<RemoteStateRecord>> {
        Ok(self.document.read().await.records.get(address).cloned())
    }

    async fn put(
        &self,
        record: RemoteStateRecord,
        expected_version: Option<u64>,
    ) -> Result<RemoteStateRecord> {
        let mut document = self.document.write().await;
        let stored = document.put(record, expected_version)?;
        debug!("Stored {} at version {}", stored.address, stored.version);
        Ok(stored)
    }

    async fn delete(&self, address: &ResourceAddress, expected_version: u64) -> Result<()> {
        let mut document = self.document.write().await;
        document.delete(address, expected_version)?;
        debug!("Removed {address} at version {}", document.serial);
        Ok(())
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        Ok(self.document.read().await.snapshot())
    }

    async fn version(&self) -> Result<u64> {
        Ok(self.document.read().await.serial)
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::AttributeMap;
    use tokio_test::{assert_err, assert_ok};

    fn record(name: &str) -> RemoteStateRecord {
        let address = ResourceAddress::new("kx_database", name).expect("valid address");
        RemoteStateRecord::new(address, format!("{name}-id"), AttributeMap::new(), 1)
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryStateStore::new();

        let stored = assert_ok!(store.put(record("db"), None).await);
        assert_eq!(stored.version, 1);
        assert_eq!(assert_ok!(store.version().await), 1);

        let loaded = assert_ok!(store.get(&stored.address).await).expect("record exists");
        assert_eq!(loaded.remote_id, "db-id");

        assert_ok!(store.delete(&stored.address, stored.version).await);
        assert!(assert_ok!(store.get(&stored.address).await).is_none());
        assert_eq!(assert_ok!(store.version().await), 2);
    }

    #[tokio::test]
    async fn test_stale_put_conflicts() {
        let store = MemoryStateStore::new();
        let first = assert_ok!(store.put(record("db"), None).await);

        // Writer that believes the record is still absent.
        assert_err!(store.put(record("db"), None).await);

        // Writer holding the current version wins, then the old version is stale.
        let second = assert_ok!(store.put(first.clone(), Some(first.version)).await);
        assert!(second.version > first.version);
        assert_err!(store.put(first.clone(), Some(first.version)).await);
        assert_err!(store.delete(&first.address, first.version).await);
    }
}
