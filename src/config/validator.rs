//! Configuration validation.
//!
//! This module checks a configuration for every problem it can find before
//! anything touches state: naming, backend settings, engine limits, references
//! and the shape of the resource graph.

use crate::error::{ConfigError, EngineError, Result};
use crate::graph::DependencyGraph;
use std::collections::{BTreeSet, HashSet};
use tracing::debug;

use super::spec::{decode_properties, EngineConfig, ProjectConfig, ReconcileConfig, StateBackend, StateConfig};

/// Validator for reconciliation configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    /// Kinds with a registered adapter. Empty means unchecked.
    known_kinds: BTreeSet<String>,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ConfigError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

impl ConfigValidator {
    /// Creates a validator that does not check kinds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts resource kinds to the given set.
    #[must_use]
    pub fn with_known_kinds<I, S>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_kinds = kinds.into_iter().map(Into::into).collect();
        self
    }

    /// Validates a configuration, failing on the first error.
    ///
    /// # Errors
    ///
    /// Returns the first error found.
    pub fn validate(&self, config: &ReconcileConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            return Ok(result);
        }
        let mut errors = result.errors.into_iter();
        Err(errors
            .next()
            .map_or_else(|| EngineError::internal("validation failed"), EngineError::Config))
    }

    /// Collects every error and warning without failing.
    #[must_use]
    pub fn check(&self, config: &ReconcileConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(&config.project, &mut result);
        Self::validate_state(&config.state, &mut result);
        Self::validate_engine(&config.engine, &mut result);
        self.validate_resources(config, &mut result);

        if result.errors.is_empty() {
            Self::validate_graph(config, &mut result);
        }
        result
    }

    /// Validates project configuration.
    fn validate_project(project: &ProjectConfig, result: &mut ValidationResult) {
        if project.name.is_empty() {
            result.errors.push(ConfigError::validation("Project name cannot be empty", "project.name"));
        } else if !is_valid_name(&project.name) {
            result.errors.push(ConfigError::validation(
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
                "project.name",
            ));
        }

        if project.environment.is_empty() {
            result
                .errors
                .push(ConfigError::validation("Environment cannot be empty", "project.environment"));
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_deref().is_none_or(str::is_empty) {
                    result.errors.push(ConfigError::validation(
                        "S3 bucket name is required when using S3 backend",
                        "state.bucket",
                    ));
                }
                if state.path.is_some() {
                    result
                        .warnings
                        .push(String::from("state.path: ignored by the s3 backend"));
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket: ignored by the local backend"));
                }
            }
        }
    }

    /// Validates engine limits.
    fn validate_engine(engine: &EngineConfig, result: &mut ValidationResult) {
        if engine.concurrency == 0 {
            result
                .errors
                .push(ConfigError::validation("Concurrency must be at least 1", "engine.concurrency"));
        } else if engine.concurrency > 64 {
            result.warnings.push(format!(
                "engine.concurrency: {} concurrent provider calls is unusual",
                engine.concurrency
            ));
        }

        if engine.run_timeout_secs == Some(0) {
            result.errors.push(ConfigError::validation(
                "Run timeout must be at least 1 second",
                "engine.run_timeout_secs",
            ));
        }

        let retry = &engine.retry;
        if retry.max_attempts == 0 {
            result.errors.push(ConfigError::validation(
                "Retry attempts must be at least 1",
                "engine.retry.max_attempts",
            ));
        }
        if retry.multiplier < 1.0 {
            result.errors.push(ConfigError::validation(
                "Retry multiplier must be at least 1.0",
                "engine.retry.multiplier",
            ));
        }
        if retry.initial_delay_ms > retry.max_delay_ms {
            result.errors.push(ConfigError::validation(
                format!(
                    "Initial delay {}ms exceeds max delay {}ms",
                    retry.initial_delay_ms, retry.max_delay_ms
                ),
                "engine.retry.initial_delay_ms",
            ));
        }
    }

    /// Validates every resource entry.
    fn validate_resources(&self, config: &ReconcileConfig, result: &mut ValidationResult) {
        if config.resources.is_empty() {
            result.warnings.push(String::from("No resources defined in configuration"));
        }

        let ids: HashSet<&str> = config.resource_ids().into_iter().collect();
        let mut seen = HashSet::new();

        for (i, resource) in config.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen.insert(resource.id.as_str()) {
                result.errors.push(ConfigError::DuplicateName {
                    resource_type: String::from("resource"),
                    name: resource.id.clone(),
                });
            }

            if !is_valid_id(&resource.id) {
                result.errors.push(ConfigError::validation(
                    format!(
                        "Resource id '{}' is invalid. Must start with a letter and contain only letters, digits, '-' or '_'.",
                        resource.id
                    ),
                    format!("{prefix}.id"),
                ));
            }

            if resource.kind.is_empty() {
                result
                    .errors
                    .push(ConfigError::validation("Resource kind cannot be empty", format!("{prefix}.kind")));
            } else if !self.known_kinds.is_empty() && !self.known_kinds.contains(&resource.kind) {
                result.errors.push(ConfigError::validation(
                    format!(
                        "Unknown resource kind '{}'. Known kinds: {}",
                        resource.kind,
                        self.known_kinds.iter().cloned().collect::<Vec<_>>().join(", ")
                    ),
                    format!("{prefix}.kind"),
                ));
            }

            for (j, dependency) in resource.depends_on.iter().enumerate() {
                let field = format!("{prefix}.depends_on[{j}]");
                if dependency == &resource.id {
                    result
                        .errors
                        .push(ConfigError::validation("A resource cannot depend on itself", field));
                } else if !ids.contains(dependency.as_str()) {
                    result
                        .errors
                        .push(ConfigError::validation(format!("Unknown resource '{dependency}'"), field));
                }
            }

            match resource.to_node(None) {
                Ok(node) => {
                    for reference in node.references() {
                        if !ids.contains(reference.resource.as_str()) {
                            result.errors.push(ConfigError::validation(
                                format!("Reference '{reference}' names an unknown resource"),
                                format!("{prefix}.properties"),
                            ));
                        }
                    }
                }
                Err(e) => result.errors.push(e),
            }
        }

        let kinds = config.kinds();
        for (kind, defaults) in &config.defaults {
            if !kinds.contains(kind.as_str()) {
                result
                    .warnings
                    .push(format!("defaults.{kind}: no resource of this kind is declared"));
            }
            if let Err(e) = decode_properties(defaults) {
                result.errors.push(e);
            }
        }
    }

    /// Builds the resource graph, reporting cycles.
    fn validate_graph(config: &ReconcileConfig, result: &mut ValidationResult) {
        let nodes = match config.resource_nodes() {
            Ok(nodes) => nodes,
            Err(e) => {
                result.errors.push(e);
                return;
            }
        };
        if let Err(e) = DependencyGraph::build(nodes) {
            result
                .errors
                .push(ConfigError::validation(e.to_string(), "resources"));
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    if !chars.next().is_some_and(|first| first.is_ascii_lowercase()) {
        return false;
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-') {
        return false;
    }

    !name.ends_with('-') && !name.contains("--")
}

/// Resource ids also allow uppercase letters and underscores.
fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next().is_some_and(|first| first.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    /// Error messages, prefixed with the failing field where known.
    #[must_use]
    pub fn messages(&self) -> Vec<String> {
        self.errors
            .iter()
            .map(|e| match e {
                ConfigError::ValidationError {
                    message,
                    field: Some(field),
                } => format!("{field}: {message}"),
                other => other.to_string(),
            })
            .collect()
    }
}
