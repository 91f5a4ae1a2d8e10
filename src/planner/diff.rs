//! Diff engine comparing the desired graph with last-applied state.
//!
//! Resources are classified in topological order so that each node resolves
//! its references against the actions already planned upstream.

use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::ConfigHasher;
use crate::error::GraphError;
use crate::graph::{topological_sort, DependencyGraph};
use crate::model::{Properties, ResourceId, ResourceNode};
use crate::provider::{Capabilities, PropertyMode, ProviderRegistry};
use crate::state::{AppliedState, StateSnapshot};

use super::plan::{ChangeValue, Plan, PlanAction, PlannedAction, PropertyChange};
use super::resolve::{resolve_properties, OutputTable, ResolvedProperties};

/// Engine for computing plans.
#[derive(Debug)]
pub struct DiffEngine<'a> {
    /// Adapters, consulted for capabilities.
    registry: &'a ProviderRegistry,
    /// Desired graph hasher.
    hasher: ConfigHasher,
}

impl<'a> DiffEngine<'a> {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self {
            registry,
            hasher: ConfigHasher::new(),
        }
    }

    /// Computes the plan that converges `snapshot` to `graph`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownResourceKind` if a desired or recorded resource has no
    /// adapter, and `CycleDetected` if recorded dependencies of deleted
    /// resources cannot be ordered.
    pub fn plan(&self, graph: &DependencyGraph, snapshot: &StateSnapshot) -> Result<Plan, GraphError> {
        self.registry.validate(graph, snapshot)?;

        let mut actions = BTreeMap::new();
        let mut outputs = OutputTable::new();

        for id in graph.topological_order() {
            let Some(node) = graph.get(id) else {
                continue;
            };
            let caps = self.registry.capabilities(id, &node.kind)?;
            let resolved = resolve_properties(&node.properties, &outputs);
            let planned = Self::classify(
                node,
                snapshot.get(id),
                snapshot.is_vanished(id),
                &resolved,
                &caps,
            );

            let known_outputs = match planned.action {
                PlanAction::NoOp | PlanAction::Update => planned.prior.as_ref().map(|p| p.outputs.clone()),
                _ => None,
            };
            outputs.insert(id.clone(), known_outputs);

            debug!(id = %id, action = %planned.action, "Classified resource");
            actions.insert(id.clone(), planned);
        }

        for (id, record) in &snapshot.records {
            if !graph.contains(id) {
                let planned = Self::delete_action(record, snapshot.is_vanished(id));
                debug!(id = %id, "Resource no longer declared");
                actions.insert(id.clone(), planned);
            }
        }

        let edges = Self::execution_edges(graph, &actions);
        let order = topological_sort(&edges)?;

        Ok(Plan {
            created_at: Utc::now(),
            graph_hash: self.hasher.hash_graph(graph),
            actions,
            edges,
            order,
        })
    }

    /// Classifies one desired resource.
    fn classify(
        node: &ResourceNode,
        prior: Option<&AppliedState>,
        vanished: bool,
        resolved: &ResolvedProperties,
        caps: &Capabilities,
    ) -> PlannedAction {
        let mut planned = PlannedAction {
            id: node.id.clone(),
            kind: node.kind.clone(),
            action: PlanAction::NoOp,
            changes: Vec::new(),
            replace_order: None,
            desired: Some(node.clone()),
            prior: prior.cloned(),
            base_revision: prior.map_or(0, |p| p.revision),
            vanished,
            reason: String::new(),
        };

        let Some(prior) = prior else {
            planned.action = PlanAction::Create;
            planned.changes = Self::property_changes(&Properties::new(), resolved, caps, true);
            planned.reason = String::from("not in state");
            return planned;
        };

        if vanished {
            planned.action = PlanAction::Create;
            planned.changes = Self::property_changes(&Properties::new(), resolved, caps, true);
            planned.reason = String::from("resource no longer exists");
            return planned;
        }

        planned.changes = Self::property_changes(&prior.properties, resolved, caps, false);

        if prior.kind != node.kind {
            planned.action = PlanAction::Replace;
            planned.replace_order = Some(caps.replace_order);
            planned.reason = format!("kind changed from {} to {}", prior.kind, node.kind);
        } else if planned.changes.is_empty() {
            if prior.has_deposed() {
                planned.reason = format!("{} deposed instance(s) to delete", prior.deposed.len());
            }
        } else if planned.changes.iter().any(|c| c.forces_replacement) {
            planned.action = PlanAction::Replace;
            planned.replace_order = Some(caps.replace_order);
            planned.reason = format!("forces replacement: {}", planned.replacement_keys().join(", "));
        } else {
            planned.action = PlanAction::Update;
            planned.reason = format!("{} properties changed", planned.changes.len());
        }

        planned
    }

    /// Property-level differences between applied and resolved desired values.
    ///
    /// Unknown values always count as changed. Nothing forces replacement
    /// when `creating`.
    fn property_changes(
        applied: &Properties,
        resolved: &ResolvedProperties,
        caps: &Capabilities,
        creating: bool,
    ) -> Vec<PropertyChange> {
        let keys: BTreeSet<&String> = applied.keys().chain(resolved.keys()).collect();
        let mut changes = Vec::new();

        for key in keys {
            let old = applied.get(key);
            let new = if resolved.unknown.contains(key) {
                Some(ChangeValue::Unknown)
            } else {
                match (old, resolved.known.get(key)) {
                    (Some(o), Some(n)) if o == n => continue,
                    (_, n) => n.cloned().map(ChangeValue::Known),
                }
            };

            changes.push(PropertyChange {
                key: key.clone(),
                old: old.cloned(),
                new,
                forces_replacement: !creating && caps.mode_of(key) == PropertyMode::ForceReplacement,
            });
        }

        changes
    }

    /// Plans the deletion of a recorded resource that is no longer declared.
    fn delete_action(record: &AppliedState, vanished: bool) -> PlannedAction {
        let changes = record
            .properties
            .iter()
            .map(|(key, value)| PropertyChange {
                key: key.clone(),
                old: Some(value.clone()),
                new: None,
                forces_replacement: false,
            })
            .collect();

        PlannedAction {
            id: record.id.clone(),
            kind: record.kind.clone(),
            action: PlanAction::Delete,
            changes,
            replace_order: None,
            desired: None,
            prior: Some(record.clone()),
            base_revision: record.revision,
            vanished,
            reason: if vanished {
                String::from("not declared, already gone")
            } else {
                String::from("not declared")
            },
        }
    }

    /// Execution upstreams for every action.
    ///
    /// Desired resources keep their graph edges. A deleted resource runs
    /// after every resource that used to depend on it, and before the
    /// deletion or replacement of anything it used to depend on.
    fn execution_edges(
        graph: &DependencyGraph,
        actions: &BTreeMap<ResourceId, PlannedAction>,
    ) -> BTreeMap<ResourceId, BTreeSet<ResourceId>> {
        let mut edges: BTreeMap<ResourceId, BTreeSet<ResourceId>> = actions
            .keys()
            .map(|id| (id.clone(), BTreeSet::new()))
            .collect();

        for node in graph.iter() {
            if let Some(upstream) = graph.upstream(&node.id) {
                edges.entry(node.id.clone()).or_default().extend(upstream.iter().cloned());
            }
        }

        let deleted = actions.values().filter(|a| a.action == PlanAction::Delete);
        for delete in deleted {
            for (id, other) in actions {
                if id == &delete.id {
                    continue;
                }
                let depended_on_deleted = other
                    .prior
                    .as_ref()
                    .is_some_and(|p| p.dependencies.contains(&delete.id));
                if depended_on_deleted {
                    edges.entry(delete.id.clone()).or_default().insert(id.clone());
                }
            }

            let Some(prior) = &delete.prior else {
                continue;
            };
            for dep in &prior.dependencies {
                let removes_old_instance = actions
                    .get(dep)
                    .is_some_and(|a| matches!(a.action, PlanAction::Delete | PlanAction::Replace));
                if removes_old_instance {
                    edges.entry(dep.clone()).or_default().insert(delete.id.clone());
                }
            }
        }

        edges
    }
}
