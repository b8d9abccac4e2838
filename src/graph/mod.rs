//! Dependency graph module.
//!
//! This module parses desired-state documents, validates them against the
//! registry and orders their resources by reference.

mod builder;
mod document;
mod hash;
mod parser;
mod validator;

pub use builder::{DependencyGraph, DesiredStateNode, GraphBuilder};
pub use document::{AttributeValue, DesiredStateDocument, Reference, ResourceBlock};
pub use hash::DocumentHasher;
pub use parser::{find_document_file, DocumentParser, DEFAULT_DOCUMENT_FILES};
pub use validator::{DocumentValidator, ValidationResult};

pub(crate) use builder::stable_topological_sort;
pub(crate) use document::ParsedAttributes;
