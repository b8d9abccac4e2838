//! Resource descriptor registry.
//!
//! This module maps resource type names to their schema and to the remote
//! operations that create, read, update and delete them. Data source types
//! live in a separate namespace and only support reads.

mod memory;
mod operations;
mod schema;

pub use memory::{MemoryDataSource, MemoryProvider, Operation};
pub use operations::{DataSourceOperations, ExecutionContext, RemoteObject, RemoteOperations};
pub use schema::{AttributeSchema, AttributeType, ResourceSchema};

#[cfg(test)]
pub use operations::{MockDataSourceOperations, MockRemoteOperations};

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::state::ResourceAddress;

/// A registered resource type.
#[derive(Clone)]
pub struct ResourceDescriptor {
    /// Attribute schema.
    pub schema: ResourceSchema,
    /// Remote CRUD operations.
    pub operations: Arc<dyn RemoteOperations>,
}

impl std::fmt::Debug for ResourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceDescriptor")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// A registered data source type.
#[derive(Clone)]
pub struct DataSourceDescriptor {
    /// Argument and result schema; computed attributes are results.
    pub schema: ResourceSchema,
    /// Read operation.
    pub operations: Arc<dyn DataSourceOperations>,
}

impl std::fmt::Debug for DataSourceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSourceDescriptor")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

/// Registry of resource types.
#[derive(Debug, Clone, Default)]
pub struct ResourceRegistry {
    descriptors: BTreeMap<String, ResourceDescriptor>,
    data_sources: BTreeMap<String, DataSourceDescriptor>,
}

impl ResourceRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a resource type, replacing any previous registration.
    pub fn register(&mut self, schema: ResourceSchema, operations: Arc<dyn RemoteOperations>) {
        let type_name = schema.type_name.clone();
        let descriptor = ResourceDescriptor { schema, operations };

        if self.descriptors.insert(type_name.clone(), descriptor).is_some() {
            warn!("Resource type {type_name} registered twice; keeping the latest");
        } else {
            debug!("Registered resource type {type_name}");
        }
    }

    /// Registers a resource type, builder style.
    #[must_use]
    pub fn with_type(mut self, schema: ResourceSchema, operations: Arc<dyn RemoteOperations>) -> Self {
        self.register(schema, operations);
        self
    }

    /// Gets the descriptor for a type.
    #[must_use]
    pub fn get(&self, type_name: &str) -> Option<&ResourceDescriptor> {
        self.descriptors.get(type_name)
    }

    /// Gets the schema for a type.
    #[must_use]
    pub fn schema(&self, type_name: &str) -> Option<&ResourceSchema> {
        self.get(type_name).map(|descriptor| &descriptor.schema)
    }

    /// Returns true if the type is registered.
    #[must_use]
    pub fn contains(&self, type_name: &str) -> bool {
        self.descriptors.contains_key(type_name)
    }

    /// Registers a data source type, replacing any previous registration.
    pub fn register_data_source(&mut self, schema: ResourceSchema, operations: Arc<dyn DataSourceOperations>) {
        let type_name = schema.type_name.clone();
        let descriptor = DataSourceDescriptor { schema, operations };

        if self.data_sources.insert(type_name.clone(), descriptor).is_some() {
            warn!("Data source {type_name} registered twice; keeping the latest");
        } else {
            debug!("Registered data source {type_name}");
        }
    }

    /// Registers a data source type, builder style.
    #[must_use]
    pub fn with_data_source(mut self, schema: ResourceSchema, operations: Arc<dyn DataSourceOperations>) -> Self {
        self.register_data_source(schema, operations);
        self
    }

    /// Gets the descriptor for a data source type.
    #[must_use]
    pub fn data_source(&self, type_name: &str) -> Option<&DataSourceDescriptor> {
        self.data_sources.get(type_name)
    }

    /// Gets the schema an address is validated against, by its mode.
    #[must_use]
    pub fn schema_for(&self, address: &ResourceAddress) -> Option<&ResourceSchema> {
        if address.is_data() {
            self.data_source(address.resource_type()).map(|descriptor| &descriptor.schema)
        } else {
            self.schema(address.resource_type())
        }
    }

    /// Registered type names in order.
    pub fn types(&self) -> impl Iterator<Item = &str> {
        self.descriptors.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(version: u32) -> ResourceSchema {
        ResourceSchema::new("kx_environment", version)
            .with_attribute("name", AttributeSchema::required(AttributeType::String))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = ResourceRegistry::new()
            .with_type(schema(1), Arc::new(MemoryProvider::new(schema(1))));

        assert!(registry.contains("kx_environment"));
        assert!(registry.get("kx_database").is_none());
        assert_eq!(registry.schema("kx_environment").map(|s| s.version), Some(1));
        assert_eq!(registry.types().collect::<Vec<_>>(), vec!["kx_environment"]);
    }

    #[test]
    fn test_data_sources_have_their_own_namespace() {
        let identity = ResourceSchema::new("kx_environment", 1)
            .with_attribute("account_id", AttributeSchema::computed(AttributeType::String));
        let registry = ResourceRegistry::new()
            .with_type(schema(1), Arc::new(MockRemoteOperations::new()))
            .with_data_source(identity, Arc::new(MockDataSourceOperations::new()));

        let managed = ResourceAddress::new("kx_environment", "env").expect("valid");
        let data = ResourceAddress::data("kx_environment", "env").expect("valid");

        assert!(registry.schema_for(&managed).is_some_and(|s| s.attribute("name").is_some()));
        assert!(registry.schema_for(&data).is_some_and(|s| s.attribute("account_id").is_some()));
        assert!(registry.data_source("kx_database").is_none());
    }

    #[test]
    fn test_reregistration_replaces() {
        let mut registry = ResourceRegistry::new();
        registry.register(schema(1), Arc::new(MockRemoteOperations::new()));
        registry.register(schema(2), Arc::new(MockRemoteOperations::new()));

        assert_eq!(registry.schema("kx_environment").map(|s| s.version), Some(2));
    }
}
