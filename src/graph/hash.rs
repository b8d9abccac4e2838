//! Document hashing for change detection.
//!
//! Plans record the fingerprint of the document they were built from, and
//! per-node hashes let reports show which blocks changed between runs.

use sha2::{Digest, Sha256};

use crate::state::{AttributeMap, ResourceMode};

use super::document::{DesiredStateDocument, ResourceBlock};

/// Hasher for desired-state documents.
#[derive(Debug, Default)]
pub struct DocumentHasher;

impl DocumentHasher {
    /// Creates a new document hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the entire document.
    ///
    /// Declaration order is part of the hash since it breaks ordering ties.
    #[must_use]
    pub fn hash_document(&self, document: &DesiredStateDocument) -> String {
        let mut hasher = Sha256::new();

        for (mode, block) in document.blocks() {
            if mode == ResourceMode::Data {
                hasher.update(b"data\0");
            }
            hasher.update(self.hash_block(block).as_bytes());
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource block.
    #[must_use]
    pub fn hash_block(&self, block: &ResourceBlock) -> String {
        let mut hasher = Sha256::new();

        hasher.update(block.resource_type.as_bytes());
        hasher.update([0u8]);
        hasher.update(block.name.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.hash_attributes(&block.attributes).as_bytes());

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of an attribute map.
    ///
    /// Maps serialize with sorted keys, so equal maps hash equally.
    #[must_use]
    pub fn hash_attributes(&self, attributes: &AttributeMap) -> String {
        let mut hasher = Sha256::new();

        for (name, value) in attributes {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update(canonical_json(value).as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }
}

/// Serializes a JSON value with object keys sorted at every depth.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|key| {
                    format!(
                        "{}:{}",
                        serde_json::Value::String(key.clone()),
                        canonical_json(&map[key])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}
