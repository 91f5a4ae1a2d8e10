//! State types for tracking applied resources.
//!
//! These records are the engine's memory of what each provider confirmed.
//! They are used to compute diffs and to order deletions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::model::{ExternalId, Properties, ResourceId, ResourceKind};

/// Current version of the record format.
pub const STATE_VERSION: &str = "1.0";

/// Last-applied state of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedState {
    /// Record format version.
    #[serde(default = "default_version")]
    pub version: String,
    /// Resource id.
    pub id: ResourceId,
    /// Resource kind at the time it was applied.
    pub kind: ResourceKind,
    /// Provider-assigned identifier of the live resource.
    pub external_id: ExternalId,
    /// Fully resolved properties that were applied.
    pub properties: Properties,
    /// Outputs reported by the provider.
    #[serde(default)]
    pub outputs: Properties,
    /// Dependencies the resource had when applied.
    #[serde(default)]
    pub dependencies: BTreeSet<ResourceId>,
    /// Previous instances replaced by this one that still await deletion.
    #[serde(default)]
    pub deposed: Vec<ExternalId>,
    /// Monotonic revision, incremented on every write.
    pub revision: u64,
    /// When the resource was first created.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> String {
    STATE_VERSION.to_string()
}

impl AppliedState {
    /// Creates a record for a freshly created resource.
    #[must_use]
    pub fn new(
        id: ResourceId,
        kind: ResourceKind,
        external_id: ExternalId,
        properties: Properties,
        outputs: Properties,
        revision: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION.to_string(),
            id,
            kind,
            external_id,
            properties,
            outputs,
            dependencies: BTreeSet::new(),
            deposed: Vec::new(),
            revision,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the recorded dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: BTreeSet<ResourceId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    /// Returns the next revision of this record with a new timestamp.
    #[must_use]
    pub fn next_revision(&self) -> Self {
        let mut next = self.clone();
        next.revision = self.revision.saturating_add(1);
        next.updated_at = Utc::now();
        next
    }

    /// Returns true if earlier instances still need to be deleted.
    #[must_use]
    pub fn has_deposed(&self) -> bool {
        !self.deposed.is_empty()
    }
}

/// The applied records loaded for one planning pass.
#[derive(Debug, Clone, Default)]
pub struct StateSnapshot {
    /// Records keyed by resource id.
    pub records: BTreeMap<ResourceId, AppliedState>,
    /// Resources the refresh found missing from live infrastructure.
    pub vanished: BTreeSet<ResourceId>,
}

impl StateSnapshot {
    /// Builds a snapshot from a list of records.
    #[must_use]
    pub fn from_records(records: impl IntoIterator<Item = AppliedState>) -> Self {
        Self {
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            vanished: BTreeSet::new(),
        }
    }

    /// Gets a record by id.
    #[must_use]
    pub fn get(&self, id: &ResourceId) -> Option<&AppliedState> {
        self.records.get(id)
    }

    /// Returns true if refresh found the resource missing.
    #[must_use]
    pub fn is_vanished(&self, id: &ResourceId) -> bool {
        self.vanished.contains(id)
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if there are no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
