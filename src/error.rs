//! Error types for the Halldyll reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, graph construction, state storage, provider calls and
//! reconciliation.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::model::{Reference, ResourceId, ResourceKind};

/// The main error type for the Halldyll reconciliation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Desired graph errors, raised before any I/O happens.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State store errors. These are fatal to a run.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Provider errors that escaped a single node.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The configuration file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// A `$ref` value was malformed.
    #[error("Invalid reference '{reference}': expected '<resource>.<attribute>'")]
    InvalidReference {
        /// The raw reference string.
        reference: String,
    },

    /// Duplicate resource definition.
    #[error("Duplicate {resource_type} name: {name}")]
    DuplicateName {
        /// Type of entry (resource, default, ...).
        resource_type: String,
        /// The duplicated name.
        name: String,
    },
}

/// Errors raised while building or validating the desired graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// The desired graph contains a dependency cycle.
    #[error("Dependency cycle detected: {}", format_path(path))]
    CycleDetected {
        /// The cycle, starting and ending at the same resource.
        path: Vec<ResourceId>,
    },

    /// A reference or explicit dependency names a resource that is not declared.
    #[error("Resource '{from}' references unknown resource '{target}'")]
    UnknownReference {
        /// The resource holding the reference.
        from: ResourceId,
        /// The missing target.
        target: ResourceId,
    },

    /// No provider adapter is registered for a resource kind.
    #[error("No provider registered for kind '{kind}' (resource '{id}')")]
    UnknownResourceKind {
        /// The resource that needs the adapter.
        id: ResourceId,
        /// The unregistered kind.
        kind: ResourceKind,
    },

    /// The same id was declared twice.
    #[error("Duplicate resource id: {0}")]
    DuplicateResource(ResourceId),
}

/// State store errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// Reading or writing the backing medium failed.
    #[error("State I/O error: {message}")]
    Io {
        /// Description of the failure.
        message: String,
    },

    /// A stored record is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// A write did not advance the stored revision.
    #[error("Revision conflict for '{id}': stored {stored}, attempted {attempted}")]
    RevisionConflict {
        /// Resource id.
        id: ResourceId,
        /// Revision currently stored.
        stored: u64,
        /// Revision that was rejected.
        attempted: u64,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },
}

/// Whether a provider error may succeed when retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff.
    Transient,
    /// Fails the node immediately.
    Permanent,
}

/// Errors returned by provider adapters.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The operation timed out.
    #[error("Operation timed out: {message}")]
    Timeout {
        /// Description of the timeout.
        message: String,
    },

    /// The backing API is throttling requests.
    #[error("Rate limited{}", retry_hint(*retry_after_secs))]
    RateLimited {
        /// Seconds to wait before retrying, when the API says so.
        retry_after_secs: Option<u64>,
    },

    /// The backing service is temporarily unavailable.
    #[error("Service unavailable: {message}")]
    Unavailable {
        /// Description of the outage.
        message: String,
    },

    /// The desired properties were rejected.
    #[error("Validation failed: {message}")]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    /// The operation conflicts with existing infrastructure.
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the conflict.
        message: String,
    },

    /// The resource does not exist.
    #[error("Resource not found: {external_id}")]
    NotFound {
        /// External identifier that was looked up.
        external_id: String,
    },

    /// The operation was cancelled before completing.
    #[error("Operation cancelled")]
    Cancelled,

    /// Any other permanent failure.
    #[error("{message}")]
    Other {
        /// Description of the failure.
        message: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A resolved property still contains an unresolved reference.
    #[error("Unresolved reference {reference} in resource '{id}'")]
    UnresolvedReference {
        /// Resource holding the reference.
        id: ResourceId,
        /// The reference that could not be resolved.
        reference: Reference,
    },

    /// A planned action is missing data it needs to execute.
    #[error("Invalid plan for '{id}': {reason}")]
    InvalidPlan {
        /// Resource id.
        id: ResourceId,
        /// What is missing.
        reason: String,
    },

    /// Reconciliation was aborted.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type alias for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

fn format_path(path: &[ResourceId]) -> String {
    path.iter()
        .map(ResourceId::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn retry_hint(retry_after_secs: Option<u64>) -> String {
    retry_after_secs.map_or_else(String::new, |secs| format!(", retry after {secs} seconds"))
}

impl EngineError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error came from the state store.
    #[must_use]
    pub const fn is_state_error(&self) -> bool {
        matches!(self, Self::State(_))
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl StateError {
    /// Creates an I/O error with the given message.
    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a generic permanent error.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Classifies the error for the retry policy.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } | Self::RateLimited { .. } | Self::Unavailable { .. } => {
                ErrorClass::Transient
            }
            Self::Validation { .. }
            | Self::Conflict { .. }
            | Self::NotFound { .. }
            | Self::Cancelled
            | Self::Other { .. } => ErrorClass::Permanent,
        }
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Transient)
    }

    /// Returns the delay requested by the provider, if any.
    #[must_use]
    pub const fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Returns true if the error means the resource is already gone.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
