//! Local file-based state storage backend.
//!
//! This module provides a JSON file store for single-machine use. Writes go
//! to a temporary file that is synced and renamed over the state file, and
//! every mutation holds an exclusive lock file for its read-modify-write.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ConvergeError, Result, StateError};

use super::document::StateDocument;
use super::lock::{generate_holder_id, LockInfo};
use super::store::StateStore;
use super::types::{RemoteStateRecord, ResourceAddress, StateSnapshot};

/// Default state directory name.
const STATE_DIR: &str = ".converge";

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// How many times a held lock is polled before giving up.
const LOCK_WAIT_ATTEMPTS: u32 = 40;

/// Delay between lock polls.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Path to the state file.
    state_path: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Identifier written into lock files.
    holder: String,
    /// Serializes mutations issued from this process.
    guard: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a new local state store under `./.converge`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ConvergeError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let state_path = base_dir.join(STATE_FILE);
        Self::from_parts(base_dir, state_path)
    }

    /// Creates a new local state store from a custom state file path.
    #[must_use]
    pub fn with_state_path(state_path: impl Into<PathBuf>) -> Self {
        let state_path = state_path.into();
        let base_dir = state_path
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        Self::from_parts(base_dir, state_path)
    }

    fn from_parts(base_dir: PathBuf, state_path: PathBuf) -> Self {
        let lock_path = base_dir.join(LOCK_FILE);
        Self {
            base_dir,
            state_path,
            lock_path,
            holder: generate_holder_id(),
            guard: Mutex::new(()),
        }
    }

    /// Gets the state file path.
    #[must_use]
    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StateError::storage(format!("Failed to create state directory: {e}"))
            })?;
        }
        Ok(())
    }

    /// Reads the state document, or an empty one if no file exists yet.
    async fn read_document(&self) -> Result<StateDocument> {
        let content = match fs::read_to_string(&self.state_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("State file does not exist: {}", self.state_path.display());
                return Ok(StateDocument::new());
            }
            Err(e) => {
                return Err(StateError::Corrupted {
                    message: format!("Failed to read state file: {e}"),
                }
                .into());
            }
        };

        let document: StateDocument = serde_json::from_str(&content).map_err(|e| {
            StateError::Corrupted {
                message: format!("Failed to parse state file: {e}"),
            }
        })?;
        document.check_format()?;

        Ok(document)
    }

    /// Writes the state document atomically.
    async fn write_document(&self, document: &StateDocument) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_string_pretty(document)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        // Write to a temporary file first, then rename for atomicity
        let temp_path = self.state_path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to create temp state file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::storage(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::storage(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, &self.state_path)
            .await
            .map_err(|e| StateError::storage(format!("Failed to rename state file: {e}")))?;

        debug!("State written at serial {}", document.serial);
        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(&self.lock_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::LockFailed {
                    message: format!("Failed to read lock file: {e}"),
                }
                .into());
            }
        };

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            }
        })?;

        Ok(Some(lock_info))
    }

    /// Creates the lock file exclusively; fails if it already exists.
    async fn try_create_lock_file(&self, lock_info: &LockInfo) -> std::io::Result<()> {
        let content = serde_json::to_string_pretty(lock_info)
            .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await?;

        file.write_all(content.as_bytes()).await?;
        file.sync_all().await
    }

    /// Acquires the lock file, waiting briefly for other holders.
    async fn acquire_lock(&self, operation: &str) -> Result<LockInfo> {
        self.ensure_dir().await?;

        let lock_info = LockInfo::new(&self.holder, operation);

        for attempt in 0..LOCK_WAIT_ATTEMPTS {
            match self.try_create_lock_file(&lock_info).await {
                Ok(()) => {
                    debug!("Acquired state lock {} for {operation}", lock_info.lock_id);
                    return Ok(lock_info);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match self.read_lock_file().await? {
                        Some(existing) if existing.is_expired() => {
                            warn!("Breaking expired state lock held by {existing}");
                            self.delete_lock_file().await?;
                        }
                        Some(existing) if attempt + 1 == LOCK_WAIT_ATTEMPTS => {
                            return Err(StateError::LockedByOther {
                                holder: existing.holder,
                                since: existing.acquired_at.to_rfc3339(),
                            }
                            .into());
                        }
                        _ => tokio::time::sleep(LOCK_POLL_INTERVAL).await,
                    }
                }
                Err(e) => {
                    return Err(StateError::LockFailed {
                        message: format!("Failed to create lock file: {e}"),
                    }
                    .into());
                }
            }
        }

        Err(StateError::LockFailed {
            message: format!("Lock still held after {LOCK_WAIT_ATTEMPTS} attempts"),
        }
        .into())
    }

    /// Releases the lock file if it is still ours.
    async fn release_lock(&self, lock_info: &LockInfo) -> Result<()> {
        match self.read_lock_file().await? {
            Some(existing) if existing.same_acquisition(lock_info) => {
                self.delete_lock_file().await?;
                debug!("Released state lock {}", lock_info.lock_id);
            }
            Some(existing) => {
                warn!("State lock {} was taken over by {existing}", lock_info.lock_id);
            }
            None => {}
        }
        Ok(())
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            }
            .into()),
        }
    }

    /// Runs one locked read-modify-write cycle.
    async fn mutate<T, F>(&self, operation: &str, apply: F) -> Result<T>
    where
        F: FnOnce(&mut StateDocument) -> std::result::Result<T, StateError> + Send,
        T: Send,
    {
        let _guard = self.guard.lock().await;
        let lock_info = self.acquire_lock(operation).await?;

        let result: Result<T> = async {
            let mut document = self.read_document().await?;
            let output = apply(&mut document)?;
            self.write_document(&document).await?;
            Ok(output)
        }
        .await;

        // A release failure never replaces the mutation result.
        if let Err(e) = self.release_lock(&lock_info).await {
            match &result {
                Ok(_) => warn!("State lock {} not released: {e}", lock_info.lock_id),
                Err(original) => warn!(
                    "State lock {} not released after failed {operation} ({original}): {e}",
                    lock_info.lock_id
                ),
            }
        }
        result
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn get(&self, address: &ResourceAddress) -> Result<Option<RemoteStateRecord>> {
        Ok(self.read_document().await?.records.remove(address))
    }

    async fn put(
        &self,
        record: RemoteStateRecord,
        expected_version: Option<u64>,
    ) -> Result<RemoteStateRecord> {
        let address = record.address.clone();
        let stored = self
            .mutate("put", move |document| document.put(record, expected_version))
            .await?;
        info!("Recorded {address} at version {}", stored.version);
        Ok(stored)
    }

    async fn delete(&self, address: &ResourceAddress, expected_version: u64) -> Result<()> {
        let target = address.clone();
        self.mutate("delete", move |document| {
            document.delete(&target, expected_version).map(|_| ())
        })
        .await?;
        info!("Removed {address} from state");
        Ok(())
    }

    async fn snapshot(&self) -> Result<StateSnapshot> {
        Ok(self.read_document().await?.snapshot())
    }

    async fn version(&self) -> Result<u64> {
        Ok(self.read_document().await?.serial)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
