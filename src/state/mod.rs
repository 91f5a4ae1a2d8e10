//! State management module for the reconciliation engine.
//!
//! This module provides persistent, per-resource storage of what each
//! provider last confirmed, plus the run lock that keeps two engines from
//! applying against the same store.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::{check_revision, storage_key, KeyLocks, StateStore};
pub use types::{AppliedState, StateSnapshot, STATE_VERSION};

#[cfg(test)]
pub use store::MockStateStore;
