//! State types for tracking remote resources.
//!
//! These types represent the last-observed state of resources, keyed by
//! address, and are the only thing the planner ever compares desired state
//! against.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

use crate::error::GraphError;

/// Attribute name to JSON value, ordered for deterministic output.
pub type AttributeMap = BTreeMap<String, serde_json::Value>;

/// Prefix of data source addresses.
const DATA_PREFIX: &str = "data";

/// Whether an address names a managed resource or a data source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceMode {
    /// Created, updated and destroyed by the engine.
    #[default]
    Managed,
    /// Read-only lookup, re-read on every plan and never recorded.
    Data,
}

/// Unique identifier of a resource: `(type, name)`, rendered `type.name`,
/// or `data.type.name` for data sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    mode: ResourceMode,
    resource_type: String,
    name: String,
}

/// Last-observed state of a single remote resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteStateRecord {
    /// Address of the resource.
    pub address: ResourceAddress,
    /// Opaque identifier assigned by the remote API.
    pub remote_id: String,
    /// Observed attributes, computed ones included.
    pub attributes: AttributeMap,
    /// Schema version the attributes conform to.
    pub schema_version: u32,
    /// Store version at which this record was written; 0 until persisted.
    #[serde(default)]
    pub version: u64,
    /// Addresses this resource depended on when it was written.
    #[serde(default)]
    pub dependencies: Vec<ResourceAddress>,
    /// When the record was first created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

/// Read-only copy of the store taken for one planning pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateSnapshot {
    /// Store version at which the snapshot was taken.
    pub version: u64,
    /// Every record, keyed by address.
    pub records: BTreeMap<ResourceAddress, RemoteStateRecord>,
}

impl ResourceAddress {
    /// Creates an address after validating both parts.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::InvalidAddress` if either part is malformed.
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Result<Self, GraphError> {
        let resource_type = resource_type.into();
        let name = name.into();

        for (part, label) in [(&resource_type, "type"), (&name, "name")] {
            if !is_valid_identifier(part) {
                return Err(GraphError::InvalidAddress {
                    address: format!("{resource_type}.{name}"),
                    reason: format!(
                        "{label} '{part}' must start with a lowercase letter and contain only lowercase alphanumerics, '_' or '-'"
                    ),
                });
            }
        }

        Ok(Self {
            mode: ResourceMode::Managed,
            resource_type,
            name,
        })
    }

    /// Creates a data source address.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::InvalidAddress` if either part is malformed.
    pub fn data(resource_type: impl Into<String>, name: impl Into<String>) -> Result<Self, GraphError> {
        Self::new(resource_type, name).map(|address| Self {
            mode: ResourceMode::Data,
            ..address
        })
    }

    /// Creates an address in the given mode.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::InvalidAddress` if either part is malformed.
    pub fn with_mode(
        mode: ResourceMode,
        resource_type: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, GraphError> {
        match mode {
            ResourceMode::Managed => Self::new(resource_type, name),
            ResourceMode::Data => Self::data(resource_type, name),
        }
    }

    /// Gets the mode.
    #[must_use]
    pub const fn mode(&self) -> ResourceMode {
        self.mode
    }

    /// Returns true for data source addresses.
    #[must_use]
    pub fn is_data(&self) -> bool {
        self.mode == ResourceMode::Data
    }

    /// Gets the resource type.
    #[must_use]
    pub fn resource_type(&self) -> &str {
        &self.resource_type
    }

    /// Gets the logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl RemoteStateRecord {
    /// Creates a new, not yet persisted record.
    #[must_use]
    pub fn new(
        address: ResourceAddress,
        remote_id: impl Into<String>,
        attributes: AttributeMap,
        schema_version: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            address,
            remote_id: remote_id.into(),
            attributes,
            schema_version,
            version: 0,
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: Vec<ResourceAddress>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Gets an attribute value.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes.get(name)
    }

    /// Replaces the observed attributes, keeping identity and creation time.
    pub fn observe(&mut self, remote_id: impl Into<String>, attributes: AttributeMap) {
        self.remote_id = remote_id.into();
        self.attributes = attributes;
        self.updated_at = Utc::now();
    }
}

impl StateSnapshot {
    /// Gets a record by address.
    #[must_use]
    pub fn get(&self, address: &ResourceAddress) -> Option<&RemoteStateRecord> {
        self.records.get(address)
    }

    /// Returns true if the snapshot holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns all recorded addresses in order.
    #[must_use]
    pub fn addresses(&self) -> Vec<&ResourceAddress> {
        self.records.keys().collect()
    }
}

impl FromStr for ResourceAddress {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        match parts.as_slice() {
            [resource_type, name] => Self::new(*resource_type, *name),
            [DATA_PREFIX, resource_type, name] => Self::data(*resource_type, *name),
            _ => Err(GraphError::InvalidAddress {
                address: s.to_string(),
                reason: String::from("expected '<type>.<name>' or 'data.<type>.<name>'"),
            }),
        }
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = GraphError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceAddress> for String {
    fn from(address: ResourceAddress) -> Self {
        address.to_string()
    }
}

impl std::fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_data() {
            write!(f, "{DATA_PREFIX}.")?;
        }
        write!(f, "{}.{}", self.resource_type, self.name)
    }
}

/// Validates an address part.
/// Parts must start with a lowercase letter; the rest may be lowercase
/// alphanumerics, underscores or hyphens, and may not end with a separator.
pub(crate) fn is_valid_identifier(part: &str) -> bool {
    let mut chars = part.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-') {
        return false;
    }

    !part.ends_with('-') && !part.ends_with('_')
}
