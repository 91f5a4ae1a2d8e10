//! Dependency graph module.
//!
//! Derives a directed acyclic graph from explicit dependencies and from the
//! references held in resource properties.

mod builder;

pub use builder::DependencyGraph;
pub(crate) use builder::topological_sort;
