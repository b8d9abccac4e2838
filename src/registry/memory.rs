//! In-memory remote provider.
//!
//! Stands in for a real cloud API in tests and dry runs. Objects live in a
//! map; computed attributes are filled in on create; faults can be queued
//! per operation and objects can be deleted out of band.
//!
//! [`MemoryDataSource`] answers data source reads from a fixed set of
//! result values.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::RemoteError;
use crate::state::{AttributeMap, ResourceAddress};

use super::operations::{DataSourceOperations, ExecutionContext, RemoteObject, RemoteOperations};
use super::schema::{AttributeType, ResourceSchema};

/// Remote operation kinds, for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create`
    Create,
    /// `read`
    Read,
    /// `update`
    Update,
    /// `delete`
    Delete,
}

#[derive(Debug, Default)]
struct ProviderState {
    objects: BTreeMap<String, RemoteObject>,
    faults: HashMap<Operation, VecDeque<RemoteError>>,
    calls: HashMap<Operation, u32>,
}

/// In-memory implementation of [`RemoteOperations`] for one resource type.
#[derive(Debug)]
pub struct MemoryProvider {
    schema: ResourceSchema,
    latency: Option<Duration>,
    state: Mutex<ProviderState>,
}

impl MemoryProvider {
    /// Creates a provider for the given schema.
    #[must_use]
    pub fn new(schema: ResourceSchema) -> Self {
        Self {
            schema,
            latency: None,
            state: Mutex::new(ProviderState::default()),
        }
    }

    /// Delays every call, observing cancellation while waiting.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Gets the schema this provider serves.
    #[must_use]
    pub const fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    /// Makes the next `times` calls of `operation` fail with `error`.
    pub async fn inject_fault(&self, operation: Operation, error: RemoteError, times: usize) {
        let mut state = self.state.lock().await;
        let queue = state.faults.entry(operation).or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Deletes an object behind the engine's back.
    ///
    /// Returns true if the object existed.
    pub async fn remove_out_of_band(&self, remote_id: &str) -> bool {
        let removed = self.state.lock().await.objects.remove(remote_id).is_some();
        debug!("Out-of-band delete of {remote_id}: existed={removed}");
        removed
    }

    /// Overwrites an attribute behind the engine's back.
    pub async fn set_out_of_band(&self, remote_id: &str, attribute: &str, value: Value) -> bool {
        let mut state = self.state.lock().await;
        match state.objects.get_mut(remote_id) {
            Some(object) => {
                object.attributes.insert(attribute.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Seeds an object that exists before the engine ever ran.
    pub async fn seed(&self, object: RemoteObject) {
        self.state
            .lock()
            .await
            .objects
            .insert(object.remote_id.clone(), object);
    }

    /// Gets an object by remote id.
    pub async fn object(&self, remote_id: &str) -> Option<RemoteObject> {
        self.state.lock().await.objects.get(remote_id).cloned()
    }

    /// Number of live objects.
    pub async fn object_count(&self) -> usize {
        self.state.lock().await.objects.len()
    }

    /// Number of calls made for an operation, faulted calls included.
    pub async fn call_count(&self, operation: Operation) -> u32 {
        self.state
            .lock()
            .await
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Counts the call, waits out the latency and pops a queued fault.
    async fn enter(&self, ctx: &ExecutionContext, operation: Operation) -> Result<(), RemoteError> {
        {
            let mut state = self.state.lock().await;
            *state.calls.entry(operation).or_insert(0) += 1;
        }

        if let Some(latency) = self.latency {
            tokio::select! {
                () = tokio::time::sleep(latency) => {}
                () = ctx.cancellation().cancelled() => return Err(RemoteError::Cancelled),
            }
        }

        let mut state = self.state.lock().await;
        match state.faults.get_mut(&operation).and_then(VecDeque::pop_front) {
            Some(error) => {
                debug!("Injected {operation:?} fault: {error}");
                Err(error)
            }
            None => Ok(()),
        }
    }

    /// Fills every computed attribute the desired attributes don't carry.
    fn computed_values(&self, address: &ResourceAddress, remote_id: &str) -> AttributeMap {
        let mut computed = AttributeMap::new();
        for (name, attribute) in &self.schema.attributes {
            if !attribute.computed {
                continue;
            }
            let value = match (name.as_str(), attribute.attr_type) {
                ("id", _) => Value::String(remote_id.to_string()),
                ("arn", _) => Value::String(format!(
                    "arn:memory:{}:{}/{remote_id}",
                    address.resource_type(),
                    address.name()
                )),
                (_, AttributeType::String) => Value::String(format!("{remote_id}-{name}")),
                (_, AttributeType::Number) => Value::from(0),
                (_, AttributeType::Bool) => Value::Bool(false),
                (_, AttributeType::List) => Value::Array(Vec::new()),
                (_, AttributeType::Map) => Value::Object(serde_json::Map::new()),
            };
            computed.insert(name.clone(), value);
        }
        computed
    }

    fn not_found(address: &ResourceAddress, remote_id: &str) -> RemoteError {
        RemoteError::NotFound {
            address: address.to_string(),
            remote_id: remote_id.to_string(),
        }
    }
}

#[async_trait]
impl RemoteOperations for MemoryProvider {
    async fn create(
        &self,
        ctx: &ExecutionContext,
        address: &ResourceAddress,
        attributes: &AttributeMap,
    ) -> Result<RemoteObject, RemoteError> {
        self.enter(ctx, Operation::Create).await?;

        let uuid = Uuid::new_v4().simple().to_string();
        let remote_id = format!("{}-{}", address.name(), &uuid[..12]);

        let mut observed = self.computed_values(address, &remote_id);
        observed.extend(attributes.clone());

        let object = RemoteObject::new(remote_id.clone(), observed);
        self.state
            .lock()
            .await
            .objects
            .insert(remote_id.clone(), object.clone());

        debug!("Created {address} as {remote_id} (request {})", ctx.request_id());
        Ok(object)
    }

    async fn read(
        &self,
        ctx: &ExecutionContext,
        address: &ResourceAddress,
        remote_id: &str,
    ) -> Result<RemoteObject, RemoteError> {
        self.enter(ctx, Operation::Read).await?;

        self.state
            .lock()
            .await
            .objects
            .get(remote_id)
            .cloned()
            .ok_or_else(|| Self::not_found(address, remote_id))
    }

    async fn update(
        &self,
        ctx: &ExecutionContext,
        address: &ResourceAddress,
        remote_id: &str,
        attributes: &AttributeMap,
    ) -> Result<RemoteObject, RemoteError> {
        self.enter(ctx, Operation::Update).await?;

        let mut state = self.state.lock().await;
        let object = state
            .objects
            .get_mut(remote_id)
            .ok_or_else(|| Self::not_found(address, remote_id))?;

        // Configurable attributes absent from the request are unset.
        let schema = &self.schema;
        object
            .attributes
            .retain(|name, _| schema.is_computed(name) || attributes.contains_key(name));
        object.attributes.extend(attributes.clone());

        debug!("Updated {address} ({remote_id})");
        Ok(object.clone())
    }

    async fn delete(
        &self,
        ctx: &ExecutionContext,
        address: &ResourceAddress,
        remote_id: &str,
    ) -> Result<(), RemoteError> {
        self.enter(ctx, Operation::Delete).await?;

        match self.state.lock().await.objects.remove(remote_id) {
            Some(_) => {
                debug!("Deleted {address} ({remote_id})");
                Ok(())
            }
            None => Err(Self::not_found(address, remote_id)),
        }
    }
}

#[derive(Debug, Default)]
struct DataSourceState {
    values: AttributeMap,
    faults: VecDeque<RemoteError>,
    reads: u32,
}

/// In-memory implementation of [`DataSourceOperations`].
///
/// Every read returns the arguments merged with the configured values.
#[derive(Debug, Default)]
pub struct MemoryDataSource {
    state: Mutex<DataSourceState>,
}

impl MemoryDataSource {
    /// Creates a data source answering with `values`.
    #[must_use]
    pub fn new(values: AttributeMap) -> Self {
        Self {
            state: Mutex::new(DataSourceState {
                values,
                ..DataSourceState::default()
            }),
        }
    }

    /// Changes a result value, as the outside world would.
    pub async fn set_value(&self, name: &str, value: Value) {
        self.state.lock().await.values.insert(name.to_string(), value);
    }

    /// Makes the next `times` reads fail with `error`.
    pub async fn inject_fault(&self, error: RemoteError, times: usize) {
        self.state
            .lock()
            .await
            .faults
            .extend(std::iter::repeat_n(error, times));
    }

    /// Number of reads, faulted ones included.
    pub async fn read_count(&self) -> u32 {
        self.state.lock().await.reads
    }
}

#[async_trait]
impl DataSourceOperations for MemoryDataSource {
    async fn read(
        &self,
        ctx: &ExecutionContext,
        address: &ResourceAddress,
        arguments: &AttributeMap,
    ) -> Result<AttributeMap, RemoteError> {
        if ctx.cancellation().is_cancelled() {
            return Err(RemoteError::Cancelled);
        }

        let mut state = self.state.lock().await;
        state.reads += 1;
        if let Some(error) = state.faults.pop_front() {
            debug!("Injected read fault for {address}: {error}");
            return Err(error);
        }

        let mut result = arguments.clone();
        result.extend(state.values.clone());
        debug!("Read {address} (request {})", ctx.request_id());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::schema::AttributeSchema;
    use serde_json::json;

    fn provider() -> MemoryProvider {
        MemoryProvider::new(
            ResourceSchema::new("kx_database", 1)
                .with_attribute("name", AttributeSchema::required(AttributeType::String))
                .with_attribute("description", AttributeSchema::optional(AttributeType::String))
                .with_attribute("arn", AttributeSchema::computed(AttributeType::String))
                .with_attribute("created_timestamp", AttributeSchema::computed(AttributeType::String)),
        )
    }

    fn address() -> ResourceAddress {
        ResourceAddress::new("kx_database", "test").expect("valid address")
    }

    fn desired() -> AttributeMap {
        let mut attributes = AttributeMap::new();
        attributes.insert(String::from("name"), json!("db"));
        attributes.insert(String::from("description"), json!("first"));
        attributes
    }

    #[tokio::test]
    async fn test_create_fills_computed_attributes() {
        let provider = provider();
        let ctx = ExecutionContext::new();

        let object = provider
            .create(&ctx, &address(), &desired())
            .await
            .expect("create");

        assert_eq!(object.attributes["name"], json!("db"));
        assert!(object.attributes["arn"]
            .as_str()
            .is_some_and(|arn| arn.ends_with(&object.remote_id)));
        assert!(object.attributes.contains_key("created_timestamp"));
        assert_eq!(provider.object_count().await, 1);
    }

    #[tokio::test]
    async fn test_update_unsets_missing_optional_attributes() {
        let provider = provider();
        let ctx = ExecutionContext::new();
        let object = provider.create(&ctx, &address(), &desired()).await.expect("create");

        let mut next = desired();
        next.remove("description");
        let updated = provider
            .update(&ctx, &address(), &object.remote_id, &next)
            .await
            .expect("update");

        assert!(!updated.attributes.contains_key("description"));
        assert_eq!(updated.attributes["arn"], object.attributes["arn"]);
    }

    #[tokio::test]
    async fn test_injected_faults_are_consumed_in_order() {
        let provider = provider();
        let ctx = ExecutionContext::new();
        provider
            .inject_fault(Operation::Create, RemoteError::transient("throttled"), 2)
            .await;

        for _ in 0..2 {
            let err = provider
                .create(&ctx, &address(), &desired())
                .await
                .expect_err("faulted");
            assert!(matches!(err, RemoteError::Transient { .. }));
        }
        provider.create(&ctx, &address(), &desired()).await.expect("third call succeeds");
        assert_eq!(provider.call_count(Operation::Create).await, 3);
    }

    #[tokio::test]
    async fn test_out_of_band_delete_reads_not_found() {
        let provider = provider();
        let ctx = ExecutionContext::new();
        let object = provider.create(&ctx, &address(), &desired()).await.expect("create");

        assert!(provider.remove_out_of_band(&object.remote_id).await);

        let err = provider
            .read(&ctx, &address(), &object.remote_id)
            .await
            .expect_err("gone");
        assert!(matches!(err, RemoteError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_latency_observes_cancellation() {
        let provider = provider().with_latency(Duration::from_secs(30));
        let ctx = ExecutionContext::new();
        ctx.cancellation().cancel();

        let err = provider
            .create(&ctx, &address(), &desired())
            .await
            .expect_err("cancelled");
        assert!(matches!(err, RemoteError::Cancelled));
    }

    #[tokio::test]
    async fn test_data_source_merges_arguments_with_values() {
        let mut values = AttributeMap::new();
        values.insert(String::from("account_id"), json!("123456789012"));
        let source = MemoryDataSource::new(values);
        let address = ResourceAddress::data("caller_identity", "current").expect("valid");
        let ctx = ExecutionContext::new();

        let mut arguments = AttributeMap::new();
        arguments.insert(String::from("region"), json!("eu-west-1"));
        let result = source.read(&ctx, &address, &arguments).await.expect("read");
        assert_eq!(result["account_id"], json!("123456789012"));
        assert_eq!(result["region"], json!("eu-west-1"));

        source.inject_fault(RemoteError::transient("throttled"), 1).await;
        assert!(source.read(&ctx, &address, &arguments).await.is_err());
        assert_eq!(source.read_count().await, 2);
    }
}
