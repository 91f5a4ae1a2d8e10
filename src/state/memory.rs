//! In-memory state storage backend.
//!
//! Used by tests and by dry runs that must not touch persistent state.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::error::{Result, StateError};
use crate::model::ResourceId;

use super::lock::{holder_or_generated, LockInfo};
use super::store::{check_revision, StateStore};
use super::types::AppliedState;

/// State store keeping every record in process memory.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<BTreeMap<ResourceId, AppliedState>>,
    lock: Mutex<Option<LockInfo>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with records.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = AppliedState>) -> Self {
        Self {
            records: Mutex::new(records.into_iter().map(|r| (r.id.clone(), r)).collect()),
            lock: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<AppliedState>> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn put(&self, state: &AppliedState) -> Result<()> {
        let mut records = self.records.lock().await;
        check_revision(records.get(&state.id), state)?;
        records.insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn remove(&self, id: &ResourceId) -> Result<()> {
        self.records.lock().await.remove(id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<AppliedState>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let mut lock = self.lock.lock().await;
        if let Some(existing) = lock.as_ref()
            && !existing.is_expired()
        {
            return Err(StateError::LockedByOther {
                holder: existing.holder.clone(),
                since: existing.acquired_at.to_rfc3339(),
            }
            .into());
        }

        let info = LockInfo::new(&holder_or_generated(holder));
        *lock = Some(info.clone());
        Ok(info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let mut lock = self.lock.lock().await;
        if lock.as_ref().is_some_and(|l| l.lock_id == lock_id) {
            *lock = None;
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        Ok(self.lock.lock().await.clone())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::model::{ExternalId, Properties, ResourceKind};

    fn record(id: &str, revision: u64) -> AppliedState {
        AppliedState::new(
            ResourceId::new(id),
            ResourceKind::new("bucket"),
            ExternalId::new(format!("ext-{id}")),
            Properties::new(),
            Properties::new(),
            revision,
        )
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let store = MemoryStateStore::new();
        tokio_test::assert_ok!(store.put(&record("a", 1)).await);

        let got = store.get(&ResourceId::new("a")).await.expect("get");
        assert_eq!(got.map(|r| r.revision), Some(1));

        store.remove(&ResourceId::new("a")).await.expect("remove");
        assert!(store.list_all().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn test_revision_must_advance() {
        let store = MemoryStateStore::with_records([record("a", 5)]);
        let err = store.put(&record("a", 4)).await.expect_err("stale write");
        assert!(matches!(err, EngineError::State(StateError::RevisionConflict { .. })));
        tokio_test::assert_ok!(store.put(&record("a", 6)).await);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let store = MemoryStateStore::new();
        let lock = store.acquire_lock("one").await.expect("first lock");
        assert!(store.acquire_lock("two").await.is_err());

        store.release_lock("some-other-id").await.expect("mismatched release");
        assert!(store.get_lock_info().await.expect("info").is_some());

        store.release_lock(&lock.lock_id).await.expect("release");
        tokio_test::assert_ok!(store.acquire_lock("two").await);
    }
}
