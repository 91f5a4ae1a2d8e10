//! Reconciliation plan types.
//!
//! This module defines the actions the diff engine derives for one run and
//! their human-readable summary.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::model::{ExternalId, ResourceId, ResourceKind, ResourceNode, Value};
use crate::provider::ReplaceOrder;
use crate::state::AppliedState;

/// Action required to converge one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    /// Create a new resource.
    Create,
    /// Update a live resource in place.
    Update,
    /// Replace a resource with a new instance.
    Replace,
    /// Delete a resource no longer declared.
    Delete,
    /// Nothing to change.
    NoOp,
}

impl PlanAction {
    /// Display rank in the plan summary.
    const fn rank(self) -> u8 {
        match self {
            Self::Create => 0,
            Self::Update => 1,
            Self::Replace => 2,
            Self::Delete => 3,
            Self::NoOp => 4,
        }
    }
}

impl fmt::Display for PlanAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

/// A planned property value.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "value")]
pub enum ChangeValue {
    /// The value is resolved.
    Known(Value),
    /// The value depends on an output produced during apply.
    Unknown,
}

impl fmt::Display for ChangeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Known(v) => write!(f, "{v}"),
            Self::Unknown => write!(f, "(known after apply)"),
        }
    }
}

/// Change of one property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    /// Property name.
    pub key: String,
    /// Last-applied value; `None` when the property is added.
    pub old: Option<Value>,
    /// Planned value; `None` when the property is removed.
    pub new: Option<ChangeValue>,
    /// The adapter cannot apply this change in place.
    pub forces_replacement: bool,
}

impl PropertyChange {
    /// One-character marker: `+` added, `-` removed, `~` modified.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match (&self.old, &self.new) {
            (None, _) => "+",
            (Some(_), None) => "-",
            (Some(_), Some(_)) => "~",
        }
    }
}

impl fmt::Display for PropertyChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.symbol(), self.key)?;
        match (&self.old, &self.new) {
            (None, Some(new)) => write!(f, " = {new}")?,
            (Some(old), None) => write!(f, " = {old}")?,
            (Some(old), Some(new)) => write!(f, " = {old} -> {new}")?,
            (None, None) => {}
        }
        if self.forces_replacement {
            write!(f, "  # forces replacement")?;
        }
        Ok(())
    }
}

/// A single planned action, consumed exactly once by the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    /// Resource id.
    pub id: ResourceId,
    /// Resource kind (the desired kind, or the recorded kind for deletes).
    pub kind: ResourceKind,
    /// What to do.
    pub action: PlanAction,
    /// Property-level changes.
    pub changes: Vec<PropertyChange>,
    /// Order of the replacement steps, for replacements only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replace_order: Option<ReplaceOrder>,
    /// Desired node; absent for deletes.
    #[serde(skip)]
    pub desired: Option<ResourceNode>,
    /// Last-applied record, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior: Option<AppliedState>,
    /// Revision of the prior record, or 0.
    pub base_revision: u64,
    /// Refresh found the live resource missing.
    pub vanished: bool,
    /// Why this action was chosen.
    pub reason: String,
}

impl PlannedAction {
    /// Summary marker for the action.
    #[must_use]
    pub const fn symbol(&self) -> &'static str {
        match (self.action, self.replace_order) {
            (PlanAction::Create, _) => "+",
            (PlanAction::Update, _) => "~",
            (PlanAction::Replace, Some(ReplaceOrder::DeleteBeforeCreate)) => "-/+",
            (PlanAction::Replace, _) => "+/-",
            (PlanAction::Delete, _) => "-",
            (PlanAction::NoOp, _) => " ",
        }
    }

    /// Earlier instances still awaiting deletion.
    #[must_use]
    pub fn deposed(&self) -> &[ExternalId] {
        self.prior.as_ref().map_or(&[][..], |p| p.deposed.as_slice())
    }

    /// Returns true if the action needs no work at all.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.action == PlanAction::NoOp && self.deposed().is_empty()
    }

    /// External id of the current live instance, if any.
    #[must_use]
    pub fn external_id(&self) -> Option<&ExternalId> {
        self.prior.as_ref().map(|p| &p.external_id)
    }

    /// Properties whose change forces replacement.
    #[must_use]
    pub fn replacement_keys(&self) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|c| c.forces_replacement)
            .map(|c| c.key.as_str())
            .collect()
    }
}

impl fmt::Display for PlannedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}.{}", self.symbol(), self.kind, self.id)?;
        if !self.reason.is_empty() {
            write!(f, " ({})", self.reason)?;
        }
        Ok(())
    }
}

/// Counts of actions by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Resources to create.
    pub create: usize,
    /// Resources to update in place.
    pub update: usize,
    /// Resources to replace.
    pub replace: usize,
    /// Resources to delete.
    pub delete: usize,
    /// Resources left unchanged.
    pub unchanged: usize,
}

/// A complete reconciliation plan.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the desired graph this plan is based on.
    pub graph_hash: String,
    /// Planned actions keyed by id.
    pub actions: BTreeMap<ResourceId, PlannedAction>,
    /// Execution upstreams: an action starts only after all of these settle.
    pub edges: BTreeMap<ResourceId, BTreeSet<ResourceId>>,
    /// A valid execution order.
    pub order: Vec<ResourceId>,
}

impl Plan {
    /// Gets an action by id.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&PlannedAction> {
        self.actions.get(id)
    }

    /// Iterates over actions in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &PlannedAction> {
        self.order.iter().filter_map(|id| self.actions.get(id))
    }

    /// Number of actions, including no-ops.
    #[must_use]
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Returns true if the plan holds no actions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Returns true if applying the plan would change anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.actions.values().any(|a| !a.is_settled())
    }

    /// Execution upstreams of an action.
    #[must_use]
    pub fn upstream(&self, id: &ResourceId) -> Option<&BTreeSet<ResourceId>> {
        self.edges.get(id)
    }

    /// Reverse of `edges`: the actions waiting on each action.
    #[must_use]
    pub fn downstream(&self) -> BTreeMap<ResourceId, BTreeSet<ResourceId>> {
        let mut downstream: BTreeMap<ResourceId, BTreeSet<ResourceId>> = self
            .actions
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();
        for (id, upstream) in &self.edges {
            for dep in upstream {
                downstream.entry(dep.clone()).or_default().insert(id.clone());
            }
        }
        downstream
    }

    /// Action counts.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for action in self.actions.values() {
            match action.action {
                PlanAction::Create => summary.create += 1,
                PlanAction::Update => summary.update += 1,
                PlanAction::Replace => summary.replace += 1,
                PlanAction::Delete => summary.delete += 1,
                PlanAction::NoOp => summary.unchanged += 1,
            }
        }
        summary
    }

    /// Actions that change something, in summary order.
    #[must_use]
    pub fn changed_actions(&self) -> Vec<&PlannedAction> {
        let position: BTreeMap<&ResourceId, usize> =
            self.order.iter().enumerate().map(|(i, id)| (id, i)).collect();

        let mut changed: Vec<_> = self.actions.values().filter(|a| !a.is_settled()).collect();
        changed.sort_by_key(|a| (a.action.rank(), position.get(&a.id).copied().unwrap_or(usize::MAX)));
        changed
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            self.create, self.update, self.replace, self.delete, self.unchanged
        )
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required ({} resources up to date)", self.len());
        }

        writeln!(f, "Plan: {}", self.summary())?;
        for action in self.changed_actions() {
            writeln!(f, "  {action}")?;
            for change in &action.changes {
                writeln!(f, "      {change}")?;
            }
            for deposed in action.deposed() {
                writeln!(f, "      - deposed instance {deposed}")?;
            }
        }
        Ok(())
    }
}
