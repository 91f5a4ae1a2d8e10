//! Provider registry keyed by resource kind.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::GraphError;
use crate::graph::DependencyGraph;
use crate::model::{ResourceId, ResourceKind};
use crate::state::StateSnapshot;

use super::adapter::{Capabilities, Provider};
use super::local_file::LocalFileProvider;
use super::random_id::RandomIdProvider;

/// Kind name of the built-in file adapter.
pub const LOCAL_FILE_KIND: &str = "local_file";

/// Kind name of the built-in random identifier adapter.
pub const RANDOM_ID_KIND: &str = "random_id";

/// Maps resource kinds to their adapters.
///
/// Built explicitly at startup and passed by reference to the engine.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ResourceKind, Arc<dyn Provider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.providers.keys().map(ResourceKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("ProviderRegistry").field("kinds", &kinds).finish()
    }
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in adapters.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(LOCAL_FILE_KIND, Arc::new(LocalFileProvider::new()));
        registry.register(RANDOM_ID_KIND, Arc::new(RandomIdProvider::new()));
        registry
    }

    /// Registers an adapter, replacing any previous one for the kind.
    pub fn register(&mut self, kind: impl Into<String>, provider: Arc<dyn Provider>) {
        let kind = ResourceKind::new(kind);
        debug!("Registered provider for kind '{kind}'");
        self.providers.insert(kind, provider);
    }

    /// Returns true if an adapter is registered for the kind.
    #[must_use]
    pub fn contains(&self, kind: &ResourceKind) -> bool {
        self.providers.contains_key(kind)
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<&ResourceKind> {
        let mut kinds: Vec<_> = self.providers.keys().collect();
        kinds.sort();
        kinds
    }

    /// Looks up the adapter for a resource.
    ///
    /// # Errors
    ///
    /// Returns `UnknownResourceKind` if no adapter is registered for `kind`.
    pub fn get(&self, id: &ResourceId, kind: &ResourceKind) -> Result<Arc<dyn Provider>, GraphError> {
        self.providers
            .get(kind)
            .cloned()
            .ok_or_else(|| GraphError::UnknownResourceKind {
                id: id.clone(),
                kind: kind.clone(),
            })
    }

    /// Capabilities of the adapter for a resource.
    ///
    /// # Errors
    ///
    /// Returns `UnknownResourceKind` if no adapter is registered for `kind`.
    pub fn capabilities(&self, id: &ResourceId, kind: &ResourceKind) -> Result<Capabilities, GraphError> {
        self.get(id, kind).map(|p| p.capabilities())
    }

    /// Checks that every desired node and every recorded resource has an adapter.
    ///
    /// # Errors
    ///
    /// Returns `UnknownResourceKind` for the first resource without one.
    pub fn validate(&self, graph: &DependencyGraph, snapshot: &StateSnapshot) -> Result<(), GraphError> {
        for node in graph.iter() {
            self.get(&node.id, &node.kind)?;
        }
        for record in snapshot.records.values() {
            self.get(&record.id, &record.kind)?;
        }
        Ok(())
    }
}
