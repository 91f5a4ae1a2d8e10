//! Declared resources and the references between them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use super::value::{Properties, Value, split_reference};

/// Unique identifier of a declared resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

/// Resource kind, used to look up the provider adapter.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKind(String);

/// Identifier assigned by the provider to a live resource.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

macro_rules! string_newtype {
    ($name:ident) => {
        impl $name {
            /// Creates a new identifier.
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

string_newtype!(ResourceId);
string_newtype!(ResourceKind);
string_newtype!(ExternalId);

/// A typed edge from a property to another resource's output attribute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    /// The resource whose output is read.
    pub resource: ResourceId,
    /// Output attribute, possibly a dotted path into a nested mapping.
    pub attribute: String,
}

impl Reference {
    /// Creates a new reference.
    #[must_use]
    pub fn new(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            resource: ResourceId::new(resource),
            attribute: attribute.into(),
        }
    }

    /// Parses `"<resource>.<attribute>"`.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        split_reference(raw).map(|(resource, attribute)| Self { resource, attribute })
    }

    /// Looks the attribute up in a set of outputs.
    #[must_use]
    pub fn lookup<'a>(&self, outputs: &'a Properties) -> Option<&'a Value> {
        let mut segments = self.attribute.split('.');
        let first = segments.next()?;
        outputs.get(first)?.get_path(segments)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.attribute)
    }
}

/// A declared resource in the desired graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    /// Unique id.
    pub id: ResourceId,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Desired properties; values may reference other resources' outputs.
    pub properties: Properties,
    /// Explicit dependencies that carry no reference.
    pub depends_on: BTreeSet<ResourceId>,
}

impl ResourceNode {
    /// Creates a node without properties.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(id),
            kind: ResourceKind::new(kind),
            properties: Properties::new(),
            depends_on: BTreeSet::new(),
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(ResourceId::new(id));
        self
    }

    /// Every reference held by the node's properties.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        for value in self.properties.values() {
            value.collect_references(&mut refs);
        }
        refs
    }

    /// Ids this node depends on, via references or explicit dependencies.
    #[must_use]
    pub fn upstream_ids(&self) -> BTreeSet<ResourceId> {
        self.references()
            .into_iter()
            .map(|r| r.resource.clone())
            .chain(self.depends_on.iter().cloned())
            .collect()
    }
}

impl fmt::Display for ResourceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.id)
    }
}
