//! Configuration specification types.
//!
//! This module defines the structs that map to `halldyll.reconcile.yaml`.
//! Resource properties stay raw JSON until [`ReconcileConfig::resource_nodes`]
//! merges kind defaults under them and decodes `$ref` references.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::ConfigError;
use crate::model::{merge_properties, Properties, ResourceNode, Value};
use crate::reconciler::EngineSettings;
use crate::scheduler::{RetryPolicy, DEFAULT_CONCURRENCY};

/// Raw property mapping as written in the file.
pub type RawProperties = BTreeMap<String, serde_json::Value>;

/// The root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconcileConfig {
    /// Project-level configuration.
    pub project: ProjectConfig,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Engine tuning.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Default properties per resource kind.
    #[serde(default)]
    pub defaults: BTreeMap<String, RawProperties>,
    /// Desired resources.
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
}

/// Project-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    /// Unique name for the project.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "prod").
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// State directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Engine tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of concurrent provider calls.
    pub concurrency: usize,
    /// Read live state before planning.
    pub refresh: bool,
    /// Whole-run timeout in seconds.
    pub run_timeout_secs: Option<u64>,
    /// Retry policy for transient provider errors.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            refresh: true,
            run_timeout_secs: None,
            retry: RetryPolicy::default(),
        }
    }
}

/// One desired resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceConfig {
    /// Unique resource id.
    #[serde(alias = "name")]
    pub id: String,
    /// Resource kind, selecting the provider adapter.
    pub kind: String,
    /// Desired properties. `{ $ref: "<id>.<attr>" }` reads another resource's output.
    #[serde(default)]
    pub properties: RawProperties,
    /// Explicit dependencies beyond references.
    #[serde(default, alias = "dependsOn")]
    pub depends_on: Vec<String>,
}

fn default_environment() -> String {
    String::from("dev")
}

/// Decodes raw properties, turning `$ref` objects into references.
///
/// # Errors
///
/// Returns `InvalidReference` for a malformed `$ref`.
pub fn decode_properties(raw: &RawProperties) -> Result<Properties, ConfigError> {
    raw.iter()
        .map(|(key, value)| {
            Value::from_json(value.clone())
                .map(|v| (key.clone(), v))
                .map_err(|reference| ConfigError::InvalidReference { reference })
        })
        .collect()
}

impl EngineConfig {
    /// Converts to engine settings.
    #[must_use]
    pub fn settings(&self) -> EngineSettings {
        EngineSettings {
            concurrency: self.concurrency,
            refresh: self.refresh,
            run_timeout: self.run_timeout_secs.map(Duration::from_secs),
            retry: self.retry.clone(),
        }
    }
}

impl ResourceConfig {
    /// Builds the resource node, with `defaults` merged under its properties.
    ///
    /// # Errors
    ///
    /// Returns an error if a property holds a malformed reference.
    pub fn to_node(&self, defaults: Option<&RawProperties>) -> Result<ResourceNode, ConfigError> {
        let mut properties = match defaults {
            Some(defaults) => decode_properties(defaults)?,
            None => Properties::new(),
        };
        merge_properties(&mut properties, decode_properties(&self.properties)?);

        let mut node = ResourceNode::new(self.id.as_str(), self.kind.as_str());
        node.properties = properties;
        for dependency in &self.depends_on {
            node = node.with_dependency(dependency.as_str());
        }
        Ok(node)
    }
}

impl ReconcileConfig {
    /// Builds the desired resource nodes.
    ///
    /// # Errors
    ///
    /// Returns an error if a property holds a malformed reference.
    pub fn resource_nodes(&self) -> Result<Vec<ResourceNode>, ConfigError> {
        self.resources
            .iter()
            .map(|r| r.to_node(self.defaults.get(&r.kind)))
            .collect()
    }

    /// Returns all resource ids.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.id.as_str()).collect()
    }

    /// Returns the distinct kinds in use.
    #[must_use]
    pub fn kinds(&self) -> BTreeSet<&str> {
        self.resources.iter().map(|r| r.kind.as_str()).collect()
    }
}
