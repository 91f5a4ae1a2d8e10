//! Configuration parser for loading configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, EngineError, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use super::spec::{ReconcileConfig, StateBackend};

/// Configuration parser for loading reconciliation configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Returns the base path, if set.
    #[must_use]
    pub fn base_path(&self) -> Option<&Path> {
        self.base_path.as_deref()
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ReconcileConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(EngineError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<ReconcileConfig> {
        debug!("Parsing YAML configuration");

        let config: ReconcileConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = e.location().map_or_else(
                || source.map(|p| p.display().to_string()),
                |loc| {
                    let file = source.map_or_else(|| String::from("<input>"), |p| p.display().to_string());
                    Some(format!("{file}:{}:{}", loc.line(), loc.column()))
                },
            );
            EngineError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {} with {} resources",
            config.project.name,
            config.resources.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format:
    /// `HALLDYLL_<SECTION>_<KEY>` (e.g., `HALLDYLL_STATE_BUCKET`)
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// holds an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<ReconcileConfig> {
        let mut config = self.load_file(path)?;
        apply_overrides(&mut config, |key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                EngineError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Resolves a path from the configuration against the base path.
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let path = PathBuf::from(path);
        match &self.base_path {
            Some(base) if path.is_relative() => base.join(path),
            _ => path,
        }
    }
}

/// Applies `HALLDYLL_*` overrides read through `lookup`.
fn apply_overrides(
    config: &mut ReconcileConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> std::result::Result<(), ConfigError> {
    if let Some(name) = lookup("HALLDYLL_PROJECT_NAME") {
        debug!("Overriding project.name from environment");
        config.project.name = name;
    }
    if let Some(env) = lookup("HALLDYLL_PROJECT_ENVIRONMENT") {
        debug!("Overriding project.environment from environment");
        config.project.environment = env;
    }

    if let Some(backend) = lookup("HALLDYLL_STATE_BACKEND") {
        debug!("Overriding state.backend from environment");
        config.state.backend = match backend.to_ascii_lowercase().as_str() {
            "local" => StateBackend::Local,
            "s3" => StateBackend::S3,
            other => {
                return Err(ConfigError::validation(
                    format!("Unknown state backend '{other}'"),
                    "HALLDYLL_STATE_BACKEND",
                ));
            }
        };
    }
    if let Some(bucket) = lookup("HALLDYLL_STATE_BUCKET") {
        debug!("Overriding state.bucket from environment");
        config.state.bucket = Some(bucket);
    }
    if let Some(prefix) = lookup("HALLDYLL_STATE_PREFIX") {
        debug!("Overriding state.prefix from environment");
        config.state.prefix = Some(prefix);
    }
    if let Some(region) = lookup("HALLDYLL_STATE_REGION") {
        debug!("Overriding state.region from environment");
        config.state.region = Some(region);
    }
    if let Some(path) = lookup("HALLDYLL_STATE_PATH") {
        debug!("Overriding state.path from environment");
        config.state.path = Some(path);
    }

    if let Some(raw) = lookup("HALLDYLL_ENGINE_CONCURRENCY") {
        debug!("Overriding engine.concurrency from environment");
        config.engine.concurrency = parse_number(&raw, "HALLDYLL_ENGINE_CONCURRENCY")?;
    }
    if let Some(raw) = lookup("HALLDYLL_ENGINE_RUN_TIMEOUT_SECS") {
        debug!("Overriding engine.run_timeout_secs from environment");
        config.engine.run_timeout_secs = Some(parse_number(&raw, "HALLDYLL_ENGINE_RUN_TIMEOUT_SECS")?);
    }

    Ok(())
}

fn parse_number<T: FromStr>(raw: &str, variable: &str) -> std::result::Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::validation(format!("'{raw}' is not a valid number"), variable))
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "halldyll.reconcile.yaml",
    "halldyll.reconcile.yml",
    "reconcile.yaml",
    "reconcile.yml",
];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(EngineError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r"
project:
  name: test-project
state:
  backend: local
";

    #[test]
    fn test_parse_minimal_config() {
        let config = ConfigParser::new().parse_yaml(MINIMAL, None).expect("valid");
        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_error_carries_location() {
        let err = ConfigParser::new()
            .parse_yaml("project: [unclosed", Some(Path::new("bad.yaml")))
            .expect_err("invalid yaml");
        match err {
            EngineError::Config(ConfigError::ParseError { location, .. }) => {
                assert!(location.is_some_and(|l| l.starts_with("bad.yaml")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ConfigParser::new().parse_yaml(MINIMAL, None).expect("valid");
        let vars = HashMap::from([
            ("HALLDYLL_STATE_BACKEND", "s3"),
            ("HALLDYLL_STATE_BUCKET", "state-bucket"),
            ("HALLDYLL_ENGINE_CONCURRENCY", "8"),
        ]);

        apply_overrides(&mut config, |k| vars.get(k).map(ToString::to_string)).expect("overrides");
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.state.bucket.as_deref(), Some("state-bucket"));
        assert_eq!(config.engine.concurrency, 8);
    }

    #[test]
    fn test_invalid_env_override() {
        let mut config = ConfigParser::new().parse_yaml(MINIMAL, None).expect("valid");
        let result = apply_overrides(&mut config, |k| {
            (k == "HALLDYLL_ENGINE_CONCURRENCY").then(|| String::from("many"))
        });
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }

    #[test]
    fn test_find_config_file_walks_parents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(dir.path().join("halldyll.reconcile.yaml"), MINIMAL).expect("write");

        let found = find_config_file(&nested).expect("found");
        assert_eq!(found, dir.path().join("halldyll.reconcile.yaml"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConfigParser::new()
            .load_file("/nonexistent/halldyll.reconcile.yaml")
            .expect_err("missing");
        assert!(matches!(err, EngineError::Config(ConfigError::FileNotFound { .. })));
    }
}
