//! Remote operations interface.
//!
//! Each resource type supplies one implementation of [`RemoteOperations`].
//! Calls receive an explicit [`ExecutionContext`] instead of reaching for
//! ambient provider configuration.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::RemoteError;
use crate::state::{AttributeMap, ResourceAddress};

/// Per-call context handed to remote operations.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Provider credentials, keyed by name.
    credentials: BTreeMap<String, String>,
    /// Signals that the caller no longer wants the result.
    cancellation: CancellationToken,
    /// Identifier for correlating remote calls in logs.
    request_id: Uuid,
}

impl ExecutionContext {
    /// Creates a context with no credentials.
    #[must_use]
    pub fn new() -> Self {
        Self {
            credentials: BTreeMap::new(),
            cancellation: CancellationToken::new(),
            request_id: Uuid::new_v4(),
        }
    }

    /// Adds a credential.
    #[must_use]
    pub fn with_credential(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.credentials.insert(name.into(), value.into());
        self
    }

    /// Uses an existing cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Gets a credential by name.
    #[must_use]
    pub fn credential(&self, name: &str) -> Option<&str> {
        self.credentials.get(name).map(String::as_str)
    }

    /// Gets the cancellation token.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Gets the request id.
    #[must_use]
    pub const fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Derives a context for one remote call: same credentials, fresh request
    /// id, and a child token cancelled together with this one.
    #[must_use]
    pub fn for_call(&self) -> Self {
        Self {
            credentials: self.credentials.clone(),
            cancellation: self.cancellation.child_token(),
            request_id: Uuid::new_v4(),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.credentials.keys().map(String::as_str).collect();
        f.debug_struct("ExecutionContext")
            .field("credentials", &names)
            .field("cancelled", &self.is_cancelled())
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// A remote object as returned by the API.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteObject {
    /// Opaque identifier assigned by the remote API.
    pub remote_id: String,
    /// Every observed attribute, computed ones included.
    pub attributes: AttributeMap,
}

impl RemoteObject {
    /// Creates a remote object.
    #[must_use]
    pub fn new(remote_id: impl Into<String>, attributes: AttributeMap) -> Self {
        Self {
            remote_id: remote_id.into(),
            attributes,
        }
    }
}

/// CRUD operations for one resource type.
///
/// Implementations classify failures: throttling and eventual-consistency
/// lag as [`RemoteError::Transient`], missing objects as
/// [`RemoteError::NotFound`], everything else as [`RemoteError::Permanent`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RemoteOperations: Send + Sync {
    /// Creates the remote object from fully resolved desired attributes.
    async fn create(
        &self,
        ctx: &ExecutionContext,
        address: &ResourceAddress,
        attributes: &AttributeMap,
    ) -> Result<RemoteObject, RemoteError>;

    /// Reads the current remote object.
    async fn read(
        &self,
        ctx: &ExecutionContext,
        address: &ResourceAddress,
        remote_id: &str,
    ) -> Result<RemoteObject, RemoteError>;

    /// Updates mutable attributes in place.
    async fn update(
        &self,
        ctx: &ExecutionContext,
        address: &ResourceAddress,
        remote_id: &str,
        attributes: &AttributeMap,
    ) -> Result<RemoteObject, RemoteError>;

    /// Deletes the remote object.
    async fn delete(
        &self,
        ctx: &ExecutionContext,
        address: &ResourceAddress,
        remote_id: &str,
    ) -> Result<(), RemoteError>;

    /// Migrates attributes recorded under an older schema version.
    ///
    /// The default keeps the attributes unchanged.
    fn upgrade_state(
        &self,
        from_version: u32,
        attributes: AttributeMap,
    ) -> Result<AttributeMap, RemoteError> {
        let _ = from_version;
        Ok(attributes)
    }
}

/// Read-only lookup for one data source type.
///
/// Data sources are read on every plan with their resolved arguments; the
/// result feeds references from other blocks and is never recorded.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DataSourceOperations: Send + Sync {
    /// Reads the data source. The result holds every attribute, arguments
    /// included.
    async fn read(
        &self,
        ctx: &ExecutionContext,
        address: &ResourceAddress,
        arguments: &AttributeMap,
    ) -> Result<AttributeMap, RemoteError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_credentials() {
        let ctx = ExecutionContext::new().with_credential("secret_key", "hunter2");
        let rendered = format!("{ctx:?}");

        assert!(rendered.contains("secret_key"));
        assert!(!rendered.contains("hunter2"));
        assert_eq!(ctx.credential("secret_key"), Some("hunter2"));
    }

    #[test]
    fn test_call_context_follows_parent_cancellation() {
        let parent = ExecutionContext::new();
        let call = parent.for_call();

        assert_ne!(parent.request_id(), call.request_id());
        assert!(!call.is_cancelled());

        parent.cancellation().cancel();
        assert!(call.is_cancelled());
    }
}
