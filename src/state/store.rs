//! State store trait definition.
//!
//! This module defines the common keyed-record interface for state storage
//! backends, plus the per-id write serialization they share.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

use crate::error::{Result, StateError};
use crate::model::ResourceId;

use super::lock::LockInfo;
use super::types::AppliedState;

/// File and object key for a record id.
///
/// Lowercase ASCII letters, digits, `-` and `_` pass through. Every other
/// byte becomes `%XX` with uppercase hex, so keys never contain a path
/// separator or a dot and ids differing only in case never collide on a
/// case-insensitive filesystem.
#[must_use]
pub fn storage_key(id: &ResourceId) -> String {
    use std::fmt::Write;

    let raw = id.as_str();
    let mut key = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() || byte == b'-' || byte == b'_' {
            key.push(char::from(byte));
        } else {
            let _ = write!(key, "%{byte:02X}");
        }
    }
    key
}

/// Trait for state storage backends.
///
/// Every method is atomic per key. Implementations must serialize writes for
/// the same id and reject a `put` whose revision does not advance past the
/// stored one.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Gets the record for a resource, if any.
    async fn get(&self, id: &ResourceId) -> Result<Option<AppliedState>>;

    /// Writes a record.
    async fn put(&self, state: &AppliedState) -> Result<()>;

    /// Removes a record. Removing a missing record succeeds.
    async fn remove(&self, id: &ResourceId) -> Result<()>;

    /// Lists every stored record.
    async fn list_all(&self) -> Result<Vec<AppliedState>>;

    /// Acquires the run lock.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo>;

    /// Releases the run lock.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl StateStore for Box<dyn StateStore> {
    async fn get(&self, id: &ResourceId) -> Result<Option<AppliedState>> {
        (**self).get(id).await
    }

    async fn put(&self, state: &AppliedState) -> Result<()> {
        (**self).put(state).await
    }

    async fn remove(&self, id: &ResourceId) -> Result<()> {
        (**self).remove(id).await
    }

    async fn list_all(&self) -> Result<Vec<AppliedState>> {
        (**self).list_all().await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}

/// Per-id write locks, giving every record a single writer at a time.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<ResourceId, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive write access to `id`.
    pub async fn lock(&self, id: &ResourceId) -> OwnedMutexGuard<()> {
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id.clone()).or_default())
        };
        slot.lock_owned().await
    }
}

/// Rejects a write that would not advance the stored revision.
///
/// # Errors
///
/// Returns `RevisionConflict` when `incoming` is not newer than `stored`.
pub fn check_revision(stored: Option<&AppliedState>, incoming: &AppliedState) -> Result<()> {
    match stored {
        Some(existing) if incoming.revision <= existing.revision => {
            Err(StateError::RevisionConflict {
                id: incoming.id.clone(),
                stored: existing.revision,
                attempted: incoming.revision,
            }
            .into())
        }
        _ => Ok(()),
    }
}
