//! Resource model for the reconciliation engine.
//!
//! This module defines declared resources, their tagged property values and
//! the references that link one resource's properties to another's outputs.

mod resource;
mod value;

pub use resource::{ExternalId, Reference, ResourceId, ResourceKind, ResourceNode};
pub use value::{merge_properties, Number, Properties, Value, REF_KEY};
