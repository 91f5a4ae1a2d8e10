// ============================================================================
// Linting
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![warn(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::print_stdout)]
#![warn(clippy::todo)]
#![warn(clippy::unimplemented)]
#![warn(clippy::unwrap_in_result)]
#![warn(clippy::redundant_clone)]
#![warn(clippy::too_many_arguments)]
#![warn(clippy::cognitive_complexity)]

// Safety and robustness lints
#![deny(overflowing_literals)]
#![deny(arithmetic_overflow)]

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halldyll Reconcile
//!
//! A declarative resource reconciliation engine.
//!
//! ## Overview
//!
//! You declare a graph of resources, each with a kind, properties and
//! references to other resources' outputs. Halldyll:
//!
//! - diffs the graph against the last-applied record of every resource
//! - plans creates, updates, replacements and deletes
//! - applies the plan through pluggable provider adapters in dependency
//!   order, with bounded concurrency, retries and cancellation
//! - records every confirmed change immediately, so an interrupted run is
//!   resumed by the next one
//!
//! ## Architecture
//!
//! 1. **Desired State**: `ResourceNode`s, usually from `halldyll.reconcile.yaml`
//! 2. **Applied State**: one record per resource in a [`state::StateStore`]
//! 3. **Plan**: built by [`planner::DiffEngine`] from the two
//! 4. **Run**: [`scheduler::Scheduler`] executes the plan via [`provider::Provider`]s
//!
//! ## Modules
//!
//! - [`model`]: Resource ids, kinds, references and property values
//! - [`graph`]: Dependency graph construction and ordering
//! - [`state`]: State storage backends (local, memory, S3)
//! - [`provider`]: Adapter interface, registry and built-in adapters
//! - [`planner`]: Reference resolution, diffing and plans
//! - [`scheduler`]: Concurrent plan execution and run reports
//! - [`config`]: Configuration parsing and validation
//! - [`reconciler`]: Refresh, plan and apply in one facade
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: my-stack
//!   environment: prod
//!
//! resources:
//!   - id: suffix
//!     kind: random_id
//!     properties:
//!       byte_length: 4
//!   - id: settings
//!     kind: local_file
//!     properties:
//!       path: out/settings.txt
//!       content: { $ref: "suffix.hex" }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod model;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod scheduler;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, ReconcileConfig};
pub use error::{EngineError, Result};
pub use graph::DependencyGraph;
pub use model::{ResourceId, ResourceKind, ResourceNode, Value};
pub use planner::{DiffEngine, Plan, PlanAction};
pub use provider::{Provider, ProviderRegistry};
pub use reconciler::{DriftReport, EngineSettings, Reconciler};
pub use scheduler::{RunReport, RunStatus, Scheduler};
pub use state::{AppliedState, LocalStateStore, MemoryStateStore, S3StateStore, StateStore};
