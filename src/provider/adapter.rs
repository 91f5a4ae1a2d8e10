//! The provider adapter contract.
//!
//! Adapters are the only code that talks to external systems. The engine
//! drives them through four operations and reads their static capability
//! declaration to decide between in-place updates and replacement.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderResult;
use crate::model::{ExternalId, Properties, ResourceId};

/// How a changed property can be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyMode {
    /// The adapter can change the property on the live resource.
    UpdateInPlace,
    /// A change requires destroying and recreating the resource.
    ForceReplacement,
}

/// Order of the two halves of a replacement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceOrder {
    /// Create the successor first, then delete the old instance.
    #[default]
    CreateBeforeDelete,
    /// Delete the old instance first, e.g. because of a uniqueness constraint.
    DeleteBeforeCreate,
}

impl fmt::Display for ReplaceOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateBeforeDelete => write!(f, "create-before-delete"),
            Self::DeleteBeforeCreate => write!(f, "delete-before-create"),
        }
    }
}

/// Static declaration of what an adapter can change in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    /// Per-property modes.
    pub modes: BTreeMap<String, PropertyMode>,
    /// Mode for properties not listed in `modes`.
    pub default_mode: PropertyMode,
    /// Order used when the resource must be replaced.
    pub replace_order: ReplaceOrder,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            modes: BTreeMap::new(),
            default_mode: PropertyMode::UpdateInPlace,
            replace_order: ReplaceOrder::CreateBeforeDelete,
        }
    }
}

impl Capabilities {
    /// Capabilities where every property is updatable in place.
    #[must_use]
    pub fn updatable() -> Self {
        Self::default()
    }

    /// Capabilities where every property forces replacement.
    #[must_use]
    pub fn immutable() -> Self {
        Self {
            default_mode: PropertyMode::ForceReplacement,
            ..Self::default()
        }
    }

    /// Marks a property as forcing replacement.
    #[must_use]
    pub fn force_replacement(mut self, property: impl Into<String>) -> Self {
        self.modes.insert(property.into(), PropertyMode::ForceReplacement);
        self
    }

    /// Marks a property as updatable in place.
    #[must_use]
    pub fn update_in_place(mut self, property: impl Into<String>) -> Self {
        self.modes.insert(property.into(), PropertyMode::UpdateInPlace);
        self
    }

    /// Requires the old instance to be deleted before its successor is created.
    #[must_use]
    pub const fn delete_before_replace(mut self) -> Self {
        self.replace_order = ReplaceOrder::DeleteBeforeCreate;
        self
    }

    /// Returns the mode of a property.
    #[must_use]
    pub fn mode_of(&self, property: &str) -> PropertyMode {
        self.modes.get(property).copied().unwrap_or(self.default_mode)
    }
}

/// Per-call context handed to an adapter.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Resource being operated on.
    pub resource: ResourceId,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Fires when the run is cancelled. Adapters may abort in-flight work.
    pub cancel: CancellationToken,
}

impl OperationContext {
    /// Creates a context for the first attempt.
    #[must_use]
    pub const fn new(resource: ResourceId, cancel: CancellationToken) -> Self {
        Self {
            resource,
            attempt: 1,
            cancel,
        }
    }

    /// Returns true if the run was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Result of a confirmed create or update.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderOutput {
    /// Identifier of the live resource.
    pub external_id: ExternalId,
    /// Output attributes other resources may reference.
    pub outputs: Properties,
}

/// What an adapter observed when reading a live resource.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CurrentState {
    /// Observed properties.
    pub properties: Properties,
    /// Observed outputs.
    pub outputs: Properties,
}

/// A provider adapter for one resource kind.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Static capability declaration.
    fn capabilities(&self) -> Capabilities;

    /// Reads a live resource. `Ok(None)` means it no longer exists.
    async fn read(
        &self,
        ctx: &OperationContext,
        external_id: &ExternalId,
    ) -> ProviderResult<Option<CurrentState>>;

    /// Creates a resource from fully resolved properties.
    async fn create(
        &self,
        ctx: &OperationContext,
        desired: &Properties,
    ) -> ProviderResult<ProviderOutput>;

    /// Updates a live resource in place.
    ///
    /// `changed` holds only the differing keys; removed keys are `Null`.
    async fn update(
        &self,
        ctx: &OperationContext,
        external_id: &ExternalId,
        changed: &Properties,
    ) -> ProviderResult<ProviderOutput>;

    /// Deletes a live resource.
    async fn delete(&self, ctx: &OperationContext, external_id: &ExternalId) -> ProviderResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_modes() {
        let caps = Capabilities::updatable()
            .force_replacement("versioning")
            .delete_before_replace();

        assert_eq!(caps.mode_of("versioning"), PropertyMode::ForceReplacement);
        assert_eq!(caps.mode_of("tags"), PropertyMode::UpdateInPlace);
        assert_eq!(caps.replace_order, ReplaceOrder::DeleteBeforeCreate);

        let immutable = Capabilities::immutable().update_in_place("labels");
        assert_eq!(immutable.mode_of("size"), PropertyMode::ForceReplacement);
        assert_eq!(immutable.mode_of("labels"), PropertyMode::UpdateInPlace);
    }
}
