//! Lock file contents for the local backend.
//!
//! Version checks serialize writers inside one process; the lock file makes
//! a file-backed store's read-modify-write cycle exclusive across processes.
//! A lock left behind by a crashed process expires and may be broken.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Seconds after which an unreleased lock may be broken.
pub const LOCK_EXPIRY_SECS: i64 = 30;

/// Contents of a held lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Identifies this acquisition, so a holder never releases a lock that
    /// was broken and re-taken by someone else.
    pub lock_id: Uuid,
    /// Process holding the lock.
    pub holder: String,
    /// Store operation in progress (`put`, `delete`).
    pub operation: String,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
    /// When the lock may be broken.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Describes a fresh acquisition by `holder` for `operation`.
    #[must_use]
    pub fn new(holder: &str, operation: &str) -> Self {
        let acquired_at = Utc::now();
        Self {
            lock_id: Uuid::new_v4(),
            holder: holder.to_string(),
            operation: operation.to_string(),
            acquired_at,
            expires_at: acquired_at + Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Returns true once the lock may be broken.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    /// Returns true if both describe the same acquisition.
    #[must_use]
    pub fn same_acquisition(&self, other: &Self) -> bool {
        self.lock_id == other.lock_id
    }
}

impl std::fmt::Display for LockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} since {})",
            self.holder,
            self.operation,
            self.acquired_at.to_rfc3339()
        )
    }
}

/// Identifies this process in lock files: `hostname-pid-suffix`.
#[must_use]
pub fn generate_holder_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| String::from("unknown-host"));
    let suffix = Uuid::new_v4().simple().to_string();

    format!("{host}-{}-{}", std::process::id(), &suffix[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_lock_is_held() {
        let lock = LockInfo::new("worker", "put");
        assert!(!lock.is_expired());
        assert!(lock.to_string().starts_with("worker (put since "));
    }

    #[test]
    fn test_lock_past_expiry_can_be_broken() {
        let mut lock = LockInfo::new("worker", "delete");
        lock.expires_at = Utc::now() - Duration::seconds(1);
        assert!(lock.is_expired());
    }

    #[test]
    fn test_acquisitions_are_distinct() {
        let first = LockInfo::new("worker", "put");
        let second = LockInfo::new("worker", "put");

        assert!(first.same_acquisition(&first.clone()));
        assert!(!first.same_acquisition(&second));
    }

    #[test]
    fn test_holder_id_names_process() {
        let id = generate_holder_id();
        assert!(id.contains(&format!("-{}-", std::process::id())));
        assert_ne!(id, generate_holder_id());
    }
}
