//! Reference resolution against upstream outputs.
//!
//! Planning resolves leniently: a reference whose target will be created or
//! replaced is not known yet. Dispatch resolves strictly against confirmed
//! outputs only.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::ReconcileError;
use crate::model::{Properties, Reference, ResourceId, Value};

/// Outputs available to references, keyed by resource.
///
/// `None` marks a resource whose outputs are only known after apply.
pub type OutputTable = BTreeMap<ResourceId, Option<Properties>>;

/// Properties after plan-time resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedProperties {
    /// Fully resolved values.
    pub known: Properties,
    /// Keys whose value depends on an output not known yet.
    pub unknown: BTreeSet<String>,
}

impl ResolvedProperties {
    /// Returns true if every property is known.
    #[must_use]
    pub fn is_fully_known(&self) -> bool {
        self.unknown.is_empty()
    }

    /// Iterates over every key, known or not.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.known.keys().chain(self.unknown.iter())
    }
}

/// Looks a reference up in an output table.
#[must_use]
pub fn lookup_output(table: &OutputTable, reference: &Reference) -> Option<Value> {
    table
        .get(&reference.resource)?
        .as_ref()
        .and_then(|outputs| reference.lookup(outputs))
        .cloned()
}

/// Resolves properties, collecting keys that cannot be known yet.
#[must_use]
pub fn resolve_properties(properties: &Properties, table: &OutputTable) -> ResolvedProperties {
    let lookup = |r: &Reference| lookup_output(table, r);
    let mut resolved = ResolvedProperties::default();

    for (key, value) in properties {
        match value.resolve(&lookup) {
            Some(v) => {
                resolved.known.insert(key.clone(), v);
            }
            None => {
                resolved.unknown.insert(key.clone());
            }
        }
    }

    resolved
}

/// Resolves properties, failing on the first reference without a value.
///
/// # Errors
///
/// Returns `UnresolvedReference` naming the reference that has no output.
pub fn resolve_strict(
    id: &ResourceId,
    properties: &Properties,
    table: &OutputTable,
) -> Result<Properties, ReconcileError> {
    let lookup = |r: &Reference| lookup_output(table, r);
    let mut resolved = Properties::new();

    for (key, value) in properties {
        if let Some(v) = value.resolve(&lookup) {
            resolved.insert(key.clone(), v);
            continue;
        }

        let mut refs = Vec::new();
        value.collect_references(&mut refs);
        let missing = refs
            .into_iter()
            .find(|r| lookup_output(table, r).is_none())
            .cloned()
            .unwrap_or_else(|| Reference::new(id.as_str(), key.as_str()));

        return Err(ReconcileError::UnresolvedReference {
            id: id.clone(),
            reference: missing,
        });
    }

    Ok(resolved)
}

/// Keys that differ between `desired` and `applied`.
///
/// Removed keys are reported as `Null`.
#[must_use]
pub fn changed_properties(desired: &Properties, applied: &Properties) -> Properties {
    let mut changed: Properties = desired
        .iter()
        .filter(|(key, value)| applied.get(*key) != Some(*value))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    for key in applied.keys() {
        if !desired.contains_key(key) {
            changed.insert(key.clone(), Value::Null);
        }
    }

    changed
}
