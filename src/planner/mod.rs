//! Planning module.
//!
//! This module compares the desired graph with recorded state and produces
//! the plan the scheduler executes.

mod diff;
mod plan;
mod resolve;

pub use diff::DiffEngine;
pub use plan::{ChangeValue, Plan, PlanAction, PlanSummary, PlannedAction, PropertyChange};
pub use resolve::{
    changed_properties, lookup_output, resolve_properties, resolve_strict, OutputTable,
    ResolvedProperties,
};
