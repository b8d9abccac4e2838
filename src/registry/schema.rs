//! Resource schemas.
//!
//! A schema lists the attributes a resource type accepts, which of them the
//! remote API fills in, and which of them cannot be changed in place.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Type of an attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeType {
    /// UTF-8 string.
    String,
    /// JSON number.
    Number,
    /// Boolean.
    Bool,
    /// JSON array.
    List,
    /// JSON object.
    Map,
}

impl AttributeType {
    /// Returns true if the JSON value has this type.
    #[must_use]
    pub fn matches(self, value: &serde_json::Value) -> bool {
        matches!(
            (self, value),
            (Self::String, serde_json::Value::String(_))
                | (Self::Number, serde_json::Value::Number(_))
                | (Self::Bool, serde_json::Value::Bool(_))
                | (Self::List, serde_json::Value::Array(_))
                | (Self::Map, serde_json::Value::Object(_))
        )
    }
}

impl std::fmt::Display for AttributeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Map => "map",
        };
        write!(f, "{s}")
    }
}

/// Schema of a single attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSchema {
    /// Value type.
    #[serde(rename = "type")]
    pub attr_type: AttributeType,
    /// Must be present in desired state.
    #[serde(default)]
    pub required: bool,
    /// Assigned by the remote API; never supplied in desired state.
    #[serde(default)]
    pub computed: bool,
    /// Changing the value requires destroying and recreating the resource.
    #[serde(default)]
    pub force_new: bool,
}

impl AttributeSchema {
    /// Creates an optional, in-place updatable attribute.
    #[must_use]
    pub const fn optional(attr_type: AttributeType) -> Self {
        Self {
            attr_type,
            required: false,
            computed: false,
            force_new: false,
        }
    }

    /// Creates a required attribute.
    #[must_use]
    pub const fn required(attr_type: AttributeType) -> Self {
        Self {
            required: true,
            ..Self::optional(attr_type)
        }
    }

    /// Creates a computed attribute.
    #[must_use]
    pub const fn computed(attr_type: AttributeType) -> Self {
        Self {
            computed: true,
            ..Self::optional(attr_type)
        }
    }

    /// Marks the attribute as requiring replacement on change.
    #[must_use]
    pub const fn with_force_new(mut self) -> Self {
        self.force_new = true;
        self
    }
}

/// Schema of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Resource type name, e.g. `kx_database`.
    pub type_name: String,
    /// Schema version; records written by older versions are upgraded on refresh.
    pub version: u32,
    /// Attribute name to schema.
    pub attributes: BTreeMap<String, AttributeSchema>,
}

impl ResourceSchema {
    /// Creates an empty schema at the given version.
    #[must_use]
    pub fn new(type_name: impl Into<String>, version: u32) -> Self {
        Self {
            type_name: type_name.into(),
            version,
            attributes: BTreeMap::new(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, schema: AttributeSchema) -> Self {
        self.attributes.insert(name.into(), schema);
        self
    }

    /// Gets an attribute's schema.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&AttributeSchema> {
        self.attributes.get(name)
    }

    /// Names of required attributes.
    pub fn required_attributes(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .filter(|(_, schema)| schema.required)
            .map(|(name, _)| name.as_str())
    }

    /// Returns true if the attribute exists and is computed.
    #[must_use]
    pub fn is_computed(&self, name: &str) -> bool {
        self.attribute(name).is_some_and(|schema| schema.computed)
    }

    /// Returns true if the attribute exists and forces replacement.
    #[must_use]
    pub fn is_force_new(&self, name: &str) -> bool {
        self.attribute(name).is_some_and(|schema| schema.force_new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_matching() {
        assert!(AttributeType::String.matches(&json!("x")));
        assert!(AttributeType::Number.matches(&json!(3)));
        assert!(AttributeType::Map.matches(&json!({"k": "v"})));
        assert!(!AttributeType::Bool.matches(&json!("true")));
        assert!(!AttributeType::List.matches(&json!({})));
    }

    #[test]
    fn test_schema_builders() {
        let schema = ResourceSchema::new("kx_database", 1)
            .with_attribute("name", AttributeSchema::required(AttributeType::String).with_force_new())
            .with_attribute("description", AttributeSchema::optional(AttributeType::String))
            .with_attribute("arn", AttributeSchema::computed(AttributeType::String));

        assert!(schema.is_force_new("name"));
        assert!(!schema.is_force_new("description"));
        assert!(schema.is_computed("arn"));
        assert!(!schema.is_computed("missing"));
        assert_eq!(schema.required_attributes().collect::<Vec<_>>(), vec!["name"]);
    }
}
