//! Schema-aware validation of desired-state documents.
//!
//! Every block is checked against its registered schema before the graph is
//! built, so structural mistakes surface before any remote call. Data
//! blocks are checked against the data source schema of their type.

use std::collections::HashSet;
use tracing::debug;

use crate::error::{GraphError, Result};
use crate::registry::ResourceRegistry;
use crate::state::ResourceAddress;

use super::document::{embeds_reference, AttributeValue, DesiredStateDocument, ResourceBlock};

/// Validator for desired-state documents.
#[derive(Debug)]
pub struct DocumentValidator<'a> {
    /// Registry holding the schemas.
    registry: &'a ResourceRegistry,
}

/// Validation result containing all problems found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// Errors, in document order.
    pub errors: Vec<GraphError>,
    /// Warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

impl ValidationResult {
    /// Returns true if no errors were found.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

impl<'a> DocumentValidator<'a> {
    /// Creates a validator over a registry.
    #[must_use]
    pub const fn new(registry: &'a ResourceRegistry) -> Self {
        Self { registry }
    }

    /// Validates a document.
    ///
    /// # Errors
    ///
    /// Returns the first error found; use [`Self::collect`] for all of them.
    pub fn validate(&self, document: &DesiredStateDocument) -> Result<ValidationResult> {
        let mut result = self.collect(document);

        if result.errors.is_empty() {
            debug!(
                "Document validation passed with {} warning(s)",
                result.warnings.len()
            );
            Ok(result)
        } else {
            Err(result.errors.swap_remove(0).into())
        }
    }

    /// Validates a document, collecting every problem.
    #[must_use]
    pub fn collect(&self, document: &DesiredStateDocument) -> ValidationResult {
        let mut result = ValidationResult::default();
        let mut seen: HashSet<ResourceAddress> = HashSet::new();

        if document.resources.is_empty() {
            result
                .warnings
                .push(String::from("No resources declared; every recorded resource will be destroyed"));
        }

        for (mode, block) in document.blocks() {
            let address = match block.address(mode) {
                Ok(address) => address,
                Err(e) => {
                    result.errors.push(e);
                    continue;
                }
            };

            if !seen.insert(address.clone()) {
                result.errors.push(GraphError::DuplicateAddress {
                    address: address.to_string(),
                });
                continue;
            }

            self.validate_block(block, &address, &mut result);
        }

        result
    }

    /// Validates one block's attributes against its schema.
    fn validate_block(
        &self,
        block: &ResourceBlock,
        address: &ResourceAddress,
        result: &mut ValidationResult,
    ) {
        let Some(schema) = self.registry.schema_for(address) else {
            result.errors.push(GraphError::UnknownResourceType {
                address: address.to_string(),
                resource_type: block.resource_type.clone(),
            });
            return;
        };

        for (name, raw) in &block.attributes {
            let Some(attribute) = schema.attribute(name) else {
                result.errors.push(GraphError::attribute(
                    address.to_string(),
                    name,
                    format!("not an attribute of {}", schema.type_name),
                ));
                continue;
            };

            if attribute.computed {
                result.errors.push(GraphError::attribute(
                    address.to_string(),
                    name,
                    "computed attributes are assigned remotely and cannot be set",
                ));
                continue;
            }

            match AttributeValue::parse(address, name, raw) {
                Ok(AttributeValue::Literal(value)) => {
                    if !attribute.attr_type.matches(&value) {
                        result.errors.push(GraphError::attribute(
                            address.to_string(),
                            name,
                            format!("expected {}, got {value}", attribute.attr_type),
                        ));
                    }
                    if embeds_reference(&value) {
                        result.warnings.push(format!(
                            "{address}.{name}: '${{' inside a literal is not interpolated"
                        ));
                    }
                }
                Ok(AttributeValue::Reference(_)) => {}
                Err(e) => result.errors.push(e),
            }
        }

        for required in schema.required_attributes() {
            if !block.attributes.contains_key(required) {
                result.errors.push(GraphError::attribute(
                    address.to_string(),
                    required,
                    "required attribute is missing",
                ));
            }
        }
    }
}
