//! Post-apply verification.
//!
//! Read-only checks against the remote, used by acceptance suites after an
//! apply or destroy. [`Verifier::disappear`] is the one exception: it
//! deletes a remote object behind the state store's back to simulate
//! out-of-band removal.

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ConvergeError, PlanError, RemoteError, Result, VerifyError};
use crate::planner::{ApplyOutcome, ApplyReport, ChangeAction, RetryPolicy};
use crate::registry::{ExecutionContext, RemoteObject, ResourceDescriptor, ResourceRegistry};
use crate::state::{RemoteStateRecord, ResourceAddress, StateStore};

/// Checks remote state against recorded state.
#[derive(Clone)]
pub struct Verifier {
    registry: Arc<ResourceRegistry>,
    store: Arc<dyn StateStore>,
    context: ExecutionContext,
    retry: RetryPolicy,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("backend", &self.store.backend_type())
            .finish_non_exhaustive()
    }
}

impl Verifier {
    /// Creates a verifier.
    #[must_use]
    pub fn new(registry: Arc<ResourceRegistry>, store: Arc<dyn StateStore>) -> Self {
        Self {
            registry,
            store,
            context: ExecutionContext::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the execution context.
    #[must_use]
    pub fn with_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    /// Sets the retry policy for remote reads.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reads the remote object fresh and checks it matches the record.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError::NotInState`, `VerifyError::Missing` or
    /// `VerifyError::AttributeMismatch`.
    pub async fn check_exists(&self, address: &ResourceAddress) -> Result<RemoteObject> {
        let record = self.record(address).await?;
        let descriptor = self.descriptor(address)?;

        let object = match self.read(descriptor, address, &record.remote_id).await {
            Ok(object) => object,
            Err(RemoteError::NotFound { .. }) => {
                return Err(VerifyError::Missing {
                    address: address.to_string(),
                    remote_id: record.remote_id,
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };

        for (name, recorded) in &record.attributes {
            let actual = object.attributes.get(name).unwrap_or(&Value::Null);
            if actual != recorded {
                return Err(mismatch(address, name, recorded, actual));
            }
        }

        debug!("{address} exists as {}", object.remote_id);
        Ok(object)
    }

    /// Checks one recorded attribute value.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError::NotInState` or `VerifyError::AttributeMismatch`.
    pub async fn check_attribute(&self, address: &ResourceAddress, name: &str, expected: &Value) -> Result<()> {
        let record = self.record(address).await?;
        let actual = record.attribute(name).unwrap_or(&Value::Null);

        if actual == expected {
            Ok(())
        } else {
            Err(mismatch(address, name, expected, actual))
        }
    }

    /// Checks that a destroyed resource is gone from state and remote.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError::StillRecorded` or `VerifyError::StillExists`.
    pub async fn check_destroyed(&self, address: &ResourceAddress, remote_id: &str) -> Result<()> {
        if self.store.get(address).await?.is_some() {
            return Err(VerifyError::StillRecorded {
                address: address.to_string(),
            }
            .into());
        }

        let descriptor = self.descriptor(address)?;
        match self.read(descriptor, address, remote_id).await {
            Err(RemoteError::NotFound { .. }) => {
                debug!("{address} ({remote_id}) is destroyed");
                Ok(())
            }
            Ok(object) => Err(VerifyError::StillExists {
                address: address.to_string(),
                remote_id: object.remote_id,
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Runs [`Self::check_destroyed`] for every successful destroy in a
    /// report.
    ///
    /// # Errors
    ///
    /// Returns the first failed check.
    pub async fn check_report_destroyed(&self, report: &ApplyReport) -> Result<()> {
        for node in &report.outcomes {
            if node.action != ChangeAction::Destroy {
                continue;
            }
            if let ApplyOutcome::Success { record } = &node.outcome {
                self.check_destroyed(&record.address, &record.remote_id).await?;
            }
        }
        Ok(())
    }

    /// Deletes the remote object without touching state.
    ///
    /// # Errors
    ///
    /// Returns `VerifyError::NotInState` or the remote delete error.
    pub async fn disappear(&self, address: &ResourceAddress) -> Result<()> {
        let record = self.record(address).await?;
        let descriptor = self.descriptor(address)?;
        let ops = &descriptor.operations;
        let remote_id = record.remote_id.as_str();
        let label = format!("delete {address}");

        self.retry
            .run(&label, |_| {
                let ctx = self.context.for_call();
                async move { ops.delete(&ctx, address, remote_id).await }
            })
            .await
            .result?;

        info!("{address} ({remote_id}) deleted out of band");
        Ok(())
    }

    async fn record(&self, address: &ResourceAddress) -> Result<RemoteStateRecord> {
        self.store.get(address).await?.ok_or_else(|| {
            VerifyError::NotInState {
                address: address.to_string(),
            }
            .into()
        })
    }

    fn descriptor(&self, address: &ResourceAddress) -> Result<&ResourceDescriptor> {
        self.registry.get(address.resource_type()).ok_or_else(|| {
            PlanError::UnknownResourceType {
                address: address.to_string(),
                resource_type: address.resource_type().to_string(),
            }
            .into()
        })
    }

    async fn read(
        &self,
        descriptor: &ResourceDescriptor,
        address: &ResourceAddress,
        remote_id: &str,
    ) -> std::result::Result<RemoteObject, RemoteError> {
        let ops = &descriptor.operations;
        let label = format!("read {address}");
        self.retry
            .run(&label, |_| {
                let ctx = self.context.for_call();
                async move { ops.read(&ctx, address, remote_id).await }
            })
            .await
            .result
    }
}

fn mismatch(address: &ResourceAddress, name: &str, expected: &Value, actual: &Value) -> ConvergeError {
    VerifyError::AttributeMismatch {
        address: address.to_string(),
        attribute: name.to_string(),
        expected: expected.to_string(),
        actual: actual.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DesiredStateDocument;
    use crate::reconciler::Reconciler;
    use crate::registry::{AttributeSchema, AttributeType, MemoryProvider, ResourceSchema};
    use crate::state::{AttributeMap, MemoryStateStore};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn schema() -> ResourceSchema {
        ResourceSchema::new("kx_environment", 1)
            .with_attribute("name", AttributeSchema::required(AttributeType::String))
            .with_attribute("id", AttributeSchema::computed(AttributeType::String))
    }

    fn document() -> DesiredStateDocument {
        let mut attributes = AttributeMap::new();
        attributes.insert(String::from("name"), json!("acceptance"));
        DesiredStateDocument::new().with_resource("kx_environment", "env", attributes)
    }

    async fn applied() -> (Reconciler, Verifier, Arc<MemoryProvider>, ResourceAddress) {
        let provider = Arc::new(MemoryProvider::new(schema()));
        let registry = Arc::new(ResourceRegistry::new().with_type(schema(), provider.clone()));
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());

        let reconciler = Reconciler::new(Arc::clone(&registry), Arc::clone(&store));
        let report = reconciler.reconcile(&document()).await.expect("apply");
        assert!(report.is_success());

        let verifier = Verifier::new(registry, store);
        let address = ResourceAddress::new("kx_environment", "env").expect("valid address");
        (reconciler, verifier, provider, address)
    }

    #[tokio::test]
    async fn test_exists_and_attribute() {
        let (_, verifier, _, address) = applied().await;

        let object = assert_ok!(verifier.check_exists(&address).await);
        assert_ok!(verifier.check_attribute(&address, "id", &json!(object.remote_id)).await);
        assert_ok!(verifier.check_attribute(&address, "name", &json!("acceptance")).await);

        let err = verifier
            .check_attribute(&address, "name", &json!("other"))
            .await
            .expect_err("mismatch");
        assert!(matches!(err, ConvergeError::Verify(VerifyError::AttributeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_remote_change_fails_exists_check() {
        let (_, verifier, provider, address) = applied().await;
        let object = assert_ok!(verifier.check_exists(&address).await);

        assert!(provider.set_out_of_band(&object.remote_id, "name", json!("renamed")).await);
        assert_err!(verifier.check_exists(&address).await);
    }

    #[tokio::test]
    async fn test_disappear_then_recreate() {
        let (reconciler, verifier, provider, address) = applied().await;

        assert_ok!(verifier.disappear(&address).await);
        assert_eq!(provider.object_count().await, 0);

        let err = verifier.check_exists(&address).await.expect_err("missing");
        assert!(matches!(err, ConvergeError::Verify(VerifyError::Missing { .. })));

        // Refresh during planning drops the record instead of failing.
        let plan = assert_ok!(reconciler.plan(&document()).await);
        assert_eq!(plan.summary().create, 1);
        assert_ok!(reconciler.apply(&plan).await);
        assert_ok!(verifier.check_exists(&address).await);
    }

    #[tokio::test]
    async fn test_destroy_verified() {
        let (reconciler, verifier, _, address) = applied().await;
        let object = assert_ok!(verifier.check_exists(&address).await);

        let err = verifier
            .check_destroyed(&address, &object.remote_id)
            .await
            .expect_err("still recorded");
        assert!(matches!(err, ConvergeError::Verify(VerifyError::StillRecorded { .. })));

        let report = assert_ok!(reconciler.destroy().await);
        assert_ok!(verifier.check_report_destroyed(&report).await);
        assert_ok!(verifier.check_destroyed(&address, &object.remote_id).await);

        let err = verifier.check_exists(&address).await.expect_err("not in state");
        assert!(matches!(err, ConvergeError::Verify(VerifyError::NotInState { .. })));
    }
}
