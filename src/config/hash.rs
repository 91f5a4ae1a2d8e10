//! Desired graph hashing for change detection.
//!
//! Hashes are deterministic: properties are hashed through their canonical
//! JSON form, whose mapping keys are sorted.

use sha2::{Digest, Sha256};

use crate::graph::DependencyGraph;
use crate::model::{Properties, ResourceNode, Value};

/// Hasher for desired resources.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a new hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes a hash of the whole desired graph.
    ///
    /// This hash changes when any resource, property or dependency changes.
    #[must_use]
    pub fn hash_graph(&self, graph: &DependencyGraph) -> String {
        let mut hasher = Sha256::new();
        for node in graph.iter() {
            hasher.update(self.hash_node(node).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Computes a hash for a single resource.
    #[must_use]
    pub fn hash_node(&self, node: &ResourceNode) -> String {
        let mut hasher = Sha256::new();

        hasher.update(node.id.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(node.kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(self.hash_properties(&node.properties).as_bytes());

        // BTreeSet iteration is already sorted
        for dep in &node.depends_on {
            hasher.update(dep.as_str().as_bytes());
            hasher.update([0u8]);
        }

        hex::encode(hasher.finalize())
    }

    /// Computes a hash of a property mapping.
    #[must_use]
    pub fn hash_properties(&self, properties: &Properties) -> String {
        let canonical = Value::Mapping(properties.clone()).to_json().to_string();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes to determine if they are equal.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
