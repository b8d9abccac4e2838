//! Desired-state document types.
//!
//! A document is a list of resource blocks plus a list of data source
//! blocks. Attribute values are JSON; a string of the exact form
//! `${type.name.attribute}` (or `${data.type.name.attribute}`) is a
//! reference to a computed attribute of another block, anything else is a
//! literal.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::error::GraphError;
use crate::state::{AttributeMap, ResourceAddress, ResourceMode};

/// Opening marker of a reference.
const REFERENCE_OPEN: &str = "${";

/// Closing marker of a reference.
const REFERENCE_CLOSE: &str = "}";

/// Root desired-state document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesiredStateDocument {
    /// Declared resources, in declaration order.
    #[serde(default)]
    pub resources: Vec<ResourceBlock>,
    /// Read-only data source lookups.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<ResourceBlock>,
}

/// One declared resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceBlock {
    /// Resource type name.
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Logical name, unique per type.
    pub name: String,
    /// Desired attributes.
    #[serde(default)]
    pub attributes: AttributeMap,
}

/// A reference to another resource's attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Referenced resource.
    pub address: ResourceAddress,
    /// Referenced attribute.
    pub attribute: String,
}

/// A parsed desired attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    /// A literal JSON value.
    Literal(Value),
    /// A reference resolved from the dependency's recorded state.
    Reference(Reference),
}

impl DesiredStateDocument {
    /// Creates an empty document.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            resources: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Adds a resource block, builder style.
    #[must_use]
    pub fn with_resource(
        mut self,
        resource_type: impl Into<String>,
        name: impl Into<String>,
        attributes: AttributeMap,
    ) -> Self {
        self.resources.push(ResourceBlock {
            resource_type: resource_type.into(),
            name: name.into(),
            attributes,
        });
        self
    }

    /// Adds a data source block, builder style.
    #[must_use]
    pub fn with_data(
        mut self,
        resource_type: impl Into<String>,
        name: impl Into<String>,
        arguments: AttributeMap,
    ) -> Self {
        self.data.push(ResourceBlock {
            resource_type: resource_type.into(),
            name: name.into(),
            attributes: arguments,
        });
        self
    }

    /// Every block with its mode: data sources first, then resources.
    pub fn blocks(&self) -> impl Iterator<Item = (ResourceMode, &ResourceBlock)> {
        self.data
            .iter()
            .map(|block| (ResourceMode::Data, block))
            .chain(self.resources.iter().map(|block| (ResourceMode::Managed, block)))
    }

    /// Removes every resource block with the given address text.
    pub fn remove(&mut self, address: &str) {
        self.resources.retain(|block| block.address_text() != address);
    }

    /// Gets a block by address text.
    #[must_use]
    pub fn get(&self, address: &str) -> Option<&ResourceBlock> {
        self.resources.iter().find(|block| block.address_text() == address)
    }

    /// Gets a block by address text for modification.
    pub fn get_mut(&mut self, address: &str) -> Option<&mut ResourceBlock> {
        self.resources
            .iter_mut()
            .find(|block| block.address_text() == address)
    }
}

impl ResourceBlock {
    /// Returns `type.name`, validated or not.
    #[must_use]
    pub fn address_text(&self) -> String {
        format!("{}.{}", self.resource_type, self.name)
    }

    /// Parses the block's address in the given mode.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::InvalidAddress` if either part is malformed.
    pub fn address(&self, mode: ResourceMode) -> Result<ResourceAddress, GraphError> {
        ResourceAddress::with_mode(mode, self.resource_type.clone(), self.name.clone())
    }
}

impl Reference {
    /// Parses the inside of `${...}`.
    fn parse_inner(inner: &str) -> Option<Self> {
        let parts: Vec<&str> = inner.split('.').collect();
        let (address, attribute) = match parts.as_slice() {
            ["data", resource_type, name, attribute] => {
                (ResourceAddress::data(*resource_type, *name).ok()?, *attribute)
            }
            [resource_type, name, attribute] => (ResourceAddress::new(*resource_type, *name).ok()?, *attribute),
            _ => return None,
        };

        if attribute.is_empty() {
            return None;
        }
        Some(Self {
            address,
            attribute: attribute.to_string(),
        })
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${{{}.{}}}", self.address, self.attribute)
    }
}

impl AttributeValue {
    /// Parses a raw desired value.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::InvalidAttribute` for a `${...}` string whose
    /// inside is not `type.name.attribute`.
    pub fn parse(
        owner: &ResourceAddress,
        attribute: &str,
        value: &Value,
    ) -> Result<Self, GraphError> {
        let Value::String(text) = value else {
            return Ok(Self::Literal(value.clone()));
        };

        let inner = text
            .strip_prefix(REFERENCE_OPEN)
            .and_then(|rest| rest.strip_suffix(REFERENCE_CLOSE));

        match inner {
            None => Ok(Self::Literal(value.clone())),
            Some(inner) => Reference::parse_inner(inner).map(Self::Reference).ok_or_else(|| {
                GraphError::attribute(
                    owner.to_string(),
                    attribute,
                    format!("malformed reference '{text}', expected '${{type.name.attribute}}'"),
                )
            }),
        }
    }

    /// Returns the reference, if this is one.
    #[must_use]
    pub const fn as_reference(&self) -> Option<&Reference> {
        match self {
            Self::Reference(reference) => Some(reference),
            Self::Literal(_) => None,
        }
    }
}

impl Serialize for AttributeValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Literal(value) => value.serialize(serializer),
            Self::Reference(reference) => serializer.collect_str(reference),
        }
    }
}

/// Returns true if a literal string embeds reference syntax without being one.
pub(crate) fn embeds_reference(value: &Value) -> bool {
    match value {
        Value::String(text) => text.contains(REFERENCE_OPEN),
        Value::Array(items) => items.iter().any(embeds_reference),
        Value::Object(map) => map.values().any(embeds_reference),
        _ => false,
    }
}

/// Parsed attributes of one block.
pub(crate) type ParsedAttributes = BTreeMap<String, AttributeValue>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn owner() -> ResourceAddress {
        ResourceAddress::new("kx_database", "db").expect("valid address")
    }

    #[test]
    fn test_parse_reference() {
        let value = AttributeValue::parse(&owner(), "environment_id", &json!("${kx_environment.env.id}"))
            .expect("parses");
        let reference = value.as_reference().expect("is a reference");

        assert_eq!(reference.address.to_string(), "kx_environment.env");
        assert_eq!(reference.attribute, "id");
        assert_eq!(reference.to_string(), "${kx_environment.env.id}");
    }

    #[test]
    fn test_parse_data_reference() {
        let value = AttributeValue::parse(
            &owner(),
            "account_id",
            &json!("${data.aws_caller_identity.current.account_id}"),
        )
        .expect("parses");
        let reference = value.as_reference().expect("is a reference");

        assert!(reference.address.is_data());
        assert_eq!(reference.attribute, "account_id");
        assert_eq!(reference.to_string(), "${data.aws_caller_identity.current.account_id}");
    }

    #[test]
    fn test_literals() {
        for raw in [json!("plain"), json!(42), json!({"k": "${x.y.z}"}), json!("prefix-${a.b.c}")] {
            let value = AttributeValue::parse(&owner(), "a", &raw).expect("parses");
            assert_eq!(value, AttributeValue::Literal(raw));
        }
    }

    #[test]
    fn test_malformed_reference() {
        let err = AttributeValue::parse(&owner(), "a", &json!("${kx_environment.env}"))
            .expect_err("two parts is malformed");
        assert!(matches!(err, GraphError::InvalidAttribute { .. }));
    }

    #[test]
    fn test_document_yaml_shape() {
        let yaml = r"
resources:
  - type: kx_environment
    name: env
    attributes:
      name: env-1
  - type: kx_database
    name: db
    attributes:
      environment_id: ${kx_environment.env.id}
data:
  - type: aws_caller_identity
    name: current
";
        let document: DesiredStateDocument = serde_yaml::from_str(yaml).expect("parses");
        assert_eq!(document.resources.len(), 2);
        assert_eq!(document.data.len(), 1);
        assert_eq!(document.blocks().next().map(|(mode, _)| mode), Some(ResourceMode::Data));
        assert_eq!(document.resources[1].address_text(), "kx_database.db");
        assert_eq!(
            document.resources[1].attributes["environment_id"],
            json!("${kx_environment.env.id}")
        );
    }
}
