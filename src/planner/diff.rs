//! Attribute diffing between desired and recorded state.
//!
//! Only configurable attributes are compared; computed attributes belong to
//! the remote side and never cause a change on their own.

use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::registry::ResourceSchema;
use crate::state::{AttributeMap, RemoteStateRecord};

/// Value an attribute will have once the change is applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum PlannedValue {
    /// Known at plan time.
    Known(Value),
    /// Depends on a resource that does not exist yet; the reference text.
    Unknown(String),
    /// Not set.
    Absent,
}

/// Difference for a single attribute.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttributeDiff {
    /// Attribute name.
    pub attribute: String,
    /// Recorded value.
    pub before: Option<Value>,
    /// Planned value.
    pub after: PlannedValue,
    /// Whether this difference requires replacement.
    pub force_new: bool,
}

/// Planned values of a node's configurable attributes.
pub type PlannedAttributes = std::collections::BTreeMap<String, PlannedValue>;

/// Engine comparing planned attributes against a record.
#[derive(Debug, Default)]
pub struct DiffEngine;

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes attribute differences for an existing record.
    ///
    /// A configurable attribute that is recorded but no longer declared
    /// diffs to [`PlannedValue::Absent`].
    #[must_use]
    pub fn diff(
        &self,
        schema: &ResourceSchema,
        planned: &PlannedAttributes,
        record: &RemoteStateRecord,
    ) -> Vec<AttributeDiff> {
        let recorded = configurable(schema, &record.attributes);
        let mut diffs = Vec::new();

        for (name, attribute) in &schema.attributes {
            if attribute.computed {
                continue;
            }

            let before = recorded.get(name);
            let after = planned.get(name).cloned().unwrap_or(PlannedValue::Absent);

            let changed = match (&after, before) {
                (PlannedValue::Known(desired), Some(recorded)) => desired != recorded,
                (PlannedValue::Known(_), None) => true,
                (PlannedValue::Unknown(_), _) => true,
                (PlannedValue::Absent, recorded) => recorded.is_some_and(|v| !v.is_null()),
            };

            if changed {
                debug!("{}.{name} differs", record.address);
                diffs.push(AttributeDiff {
                    attribute: name.clone(),
                    before: before.cloned(),
                    after,
                    force_new: attribute.force_new,
                });
            }
        }

        diffs
    }

    /// Lists every planned attribute as a diff from nothing.
    #[must_use]
    pub fn diff_new(&self, schema: &ResourceSchema, planned: &PlannedAttributes) -> Vec<AttributeDiff> {
        planned
            .iter()
            .map(|(name, after)| AttributeDiff {
                attribute: name.clone(),
                before: None,
                after: after.clone(),
                force_new: schema.is_force_new(name),
            })
            .collect()
    }

    /// Returns true if any difference forces replacement.
    #[must_use]
    pub fn requires_replace(diffs: &[AttributeDiff]) -> bool {
        diffs.iter().any(|diff| diff.force_new)
    }
}

/// Drops computed and undeclared attributes from a recorded attribute map.
pub(crate) fn configurable(schema: &ResourceSchema, attributes: &AttributeMap) -> AttributeMap {
    attributes
        .iter()
        .filter(|(name, _)| schema.attribute(name).is_some_and(|attribute| !attribute.computed))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

impl PlannedValue {
    /// Returns the known value, if any.
    #[must_use]
    pub const fn known(&self) -> Option<&Value> {
        match self {
            Self::Known(value) => Some(value),
            Self::Unknown(_) | Self::Absent => None,
        }
    }
}

impl std::fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(value) => write!(f, "{value}"),
            Self::Unknown(reference) => write!(f, "(known after apply: {reference})"),
            Self::Absent => write!(f, "(absent)"),
        }
    }
}

impl std::fmt::Display for AttributeDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let before = self
            .before
            .as_ref()
            .map_or_else(|| String::from("(absent)"), ToString::to_string);
        write!(f, "{}: {before} -> {}", self.attribute, self.after)?;
        if self.force_new {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{AttributeSchema, AttributeType};
    use crate::state::ResourceAddress;
    use serde_json::json;

    fn schema() -> ResourceSchema {
        ResourceSchema::new("kx_database", 1)
            .with_attribute("name", AttributeSchema::required(AttributeType::String).with_force_new())
            .with_attribute("description", AttributeSchema::optional(AttributeType::String))
            .with_attribute("tags", AttributeSchema::optional(AttributeType::Map))
            .with_attribute("arn", AttributeSchema::computed(AttributeType::String))
    }

    fn record() -> RemoteStateRecord {
        let mut attributes = AttributeMap::new();
        attributes.insert(String::from("name"), json!("db"));
        attributes.insert(String::from("description"), json!("first"));
        attributes.insert(String::from("arn"), json!("arn:db"));
        RemoteStateRecord::new(
            ResourceAddress::new("kx_database", "db").expect("valid"),
            "db-1",
            attributes,
            1,
        )
    }

    fn planned(pairs: &[(&str, PlannedValue)]) -> PlannedAttributes {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn test_no_diff_when_equal() {
        let diffs = DiffEngine::new().diff(
            &schema(),
            &planned(&[
                ("name", PlannedValue::Known(json!("db"))),
                ("description", PlannedValue::Known(json!("first"))),
            ]),
            &record(),
        );
        assert!(diffs.is_empty());
    }

    #[test]
    fn test_update_and_unset() {
        let diffs = DiffEngine::new().diff(
            &schema(),
            &planned(&[
                ("name", PlannedValue::Known(json!("db"))),
                ("tags", PlannedValue::Known(json!({"env": "test"}))),
            ]),
            &record(),
        );

        let names: Vec<&str> = diffs.iter().map(|d| d.attribute.as_str()).collect();
        assert_eq!(names, vec!["description", "tags"]);
        assert_eq!(diffs[0].after, PlannedValue::Absent);
        assert!(!DiffEngine::requires_replace(&diffs));
    }

    #[test]
    fn test_force_new_and_unknown() {
        let diffs = DiffEngine::new().diff(
            &schema(),
            &planned(&[
                ("name", PlannedValue::Unknown(String::from("${kx_environment.env.id}"))),
                ("description", PlannedValue::Known(json!("first"))),
            ]),
            &record(),
        );

        assert_eq!(diffs.len(), 1);
        assert!(DiffEngine::requires_replace(&diffs));
        assert!(diffs[0].to_string().contains("known after apply"));
    }

    #[test]
    fn test_configurable_filters_computed() {
        let attributes = configurable(&schema(), &record().attributes);
        assert_eq!(
            attributes.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["description", "name"]
        );

        let mut legacy = record().attributes;
        legacy.insert(String::from("retired"), json!("x"));
        assert!(!configurable(&schema(), &legacy).contains_key("retired"));
    }
}
