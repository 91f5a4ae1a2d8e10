//! Configuration module for the Halldyll reconciliation engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing and deserializing `halldyll.reconcile.yaml`
//! - Validation of configuration values
//! - Computing desired graph hashes for change detection

mod hash;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES};
pub use spec::{
    decode_properties, EngineConfig, ProjectConfig, RawProperties, ReconcileConfig, ResourceConfig,
    StateBackend, StateConfig,
};
pub use validator::{ConfigValidator, ValidationResult};
