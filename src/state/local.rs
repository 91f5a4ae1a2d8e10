//! Local file-based state storage backend.
//!
//! Each resource record lives in its own JSON file under `resources/`, so a
//! write touches exactly one key. Writes go to a temporary file first and are
//! renamed into place.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{EngineError, Result, StateError};
use crate::model::ResourceId;

use super::lock::{holder_or_generated, LockInfo, LOCK_EXPIRY_SECS};
use super::store::{check_revision, storage_key, KeyLocks, StateStore};
use super::types::AppliedState;

/// Default state directory name.
pub const STATE_DIR: &str = ".halldyll";

/// Directory holding one file per resource.
const RESOURCES_DIR: &str = "resources";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Directory of per-resource records.
    resources_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Per-id write serialization.
    key_locks: KeyLocks,
}

impl LocalStateStore {
    /// Creates a new local state store in `./.halldyll`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| EngineError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        let resources_dir = base_dir.join(RESOURCES_DIR);
        let lock_path = base_dir.join(LOCK_FILE);

        Self {
            base_dir,
            resources_dir,
            lock_path,
            key_locks: KeyLocks::new(),
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the record file for `id`.
    fn record_path(&self, id: &ResourceId) -> PathBuf {
        self.resources_dir.join(format!("{}.json", storage_key(id)))
    }

    /// Ensures the state directories exist.
    async fn ensure_dirs(&self) -> Result<()> {
        if !self.resources_dir.exists() {
            debug!("Creating state directory: {}", self.resources_dir.display());
            fs::create_dir_all(&self.resources_dir)
                .await
                .map_err(|e| StateError::io(format!("Failed to create state directory: {e}")))?;
        }
        Ok(())
    }

    /// Reads and parses a record file.
    async fn read_record(path: &Path) -> Result<Option<AppliedState>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::io(format!(
                    "Failed to read state record {}: {e}",
                    path.display()
                ))
                .into());
            }
        };

        let state: AppliedState = serde_json::from_str(&content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse state record {}: {e}", path.display()))
        })?;

        Ok(Some(state))
    }

    /// Writes `content` to `path` through a temporary file and an atomic rename.
    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StateError::io(format!("Failed to create temp state file: {e}")))?;

        file.write_all(content.as_bytes())
            .await
            .map_err(|e| StateError::io(format!("Failed to write state file: {e}")))?;

        file.sync_all()
            .await
            .map_err(|e| StateError::io(format!("Failed to sync state file: {e}")))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StateError::io(format!("Failed to rename state file: {e}")))?;

        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path)
            .await
            .map_err(|e| StateError::corrupted(format!("Failed to read lock file: {e}")))?;

        let lock_info: LockInfo = serde_json::from_str(&content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock file: {e}")))?;

        Ok(Some(lock_info))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        if self.lock_path.exists() {
            fs::remove_file(&self.lock_path).await.map_err(|e| StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<AppliedState>> {
        Self::read_record(&self.record_path(id)).await
    }

    async fn put(&self, state: &AppliedState) -> Result<()> {
        let _guard = self.key_locks.lock(&state.id).await;
        self.ensure_dirs().await?;

        let path = self.record_path(&state.id);
        let stored = Self::read_record(&path).await?;
        check_revision(stored.as_ref(), state)?;

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        Self::write_atomic(&path, &content).await?;
        debug!(id = %state.id, revision = state.revision, "State record saved");
        Ok(())
    }

    async fn remove(&self, id: &ResourceId) -> Result<()> {
        let _guard = self.key_locks.lock(id).await;
        let path = self.record_path(id);

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(id = %id, "State record removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::io(format!("Failed to delete state record: {e}")).into()),
        }
    }

    async fn list_all(&self) -> Result<Vec<AppliedState>> {
        if !self.resources_dir.exists() {
            debug!("State directory does not exist: {}", self.resources_dir.display());
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.resources_dir)
            .await
            .map_err(|e| StateError::io(format!("Failed to list state directory: {e}")))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StateError::io(format!("Failed to list state directory: {e}")))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = Self::read_record(&path).await? {
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        info!("Loaded {} state records from {}", records.len(), self.base_dir.display());
        Ok(records)
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock found, taking over");
        }

        fs::create_dir_all(&self.base_dir)
            .await
            .map_err(|e| StateError::LockFailed {
                message: format!("Failed to create state directory: {e}"),
            })?;

        let lock_info = LockInfo::new(&holder_or_generated(holder));
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        Self::write_atomic(&self.lock_path, &content)
            .await
            .map_err(|e| StateError::LockFailed {
                message: e.to_string(),
            })?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
