//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible
//! services). Each record is its own object under `<prefix>resources/`, so a
//! write replaces exactly one key.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{Result, StateError};
use crate::model::ResourceId;

use super::lock::{holder_or_generated, LockInfo, LOCK_EXPIRY_SECS};
use super::store::{check_revision, storage_key, KeyLocks, StateStore};
use super::types::AppliedState;

/// Key segment holding one object per resource.
const RESOURCES_KEY: &str = "resources/";

/// Lock object key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending in `/`.
    prefix: String,
    /// Per-id write serialization within this process.
    key_locks: KeyLocks,
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            key_locks: KeyLocks::new(),
        }
    }

    /// Key of the record object for `id`.
    fn record_key(&self, id: &ResourceId) -> String {
        format!("{}{RESOURCES_KEY}{}.json", self.prefix, storage_key(id))
    }

    /// Key of the lock object.
    fn lock_key(&self) -> String {
        format!("{}{LOCK_KEY}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response
                    .body
                    .collect()
                    .await
                    .map_err(|e| StateError::s3(format!("Failed to read S3 object: {e}")))?;

                let content = String::from_utf8(bytes.to_vec())
                    .map_err(|e| StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}")))?;

                Ok(Some(content))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 put error: {e}")))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StateError::s3(format!("S3 delete error: {e}")))?;

        Ok(())
    }

    /// Lists every record key, following continuation tokens.
    async fn list_record_keys(&self) -> Result<Vec<String>> {
        let prefix = format!("{}{RESOURCES_KEY}", self.prefix);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StateError::s3(format!("S3 list error: {e}")))?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter(|key| key.ends_with(".json"))
                    .map(ToString::to_string),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(keys)
    }

    fn parse_record(key: &str, content: &str) -> Result<AppliedState> {
        serde_json::from_str(content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state record {key}: {e}")).into())
    }

    fn parse_lock(content: &str) -> Result<LockInfo> {
        serde_json::from_str(content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")).into())
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<AppliedState>> {
        let key = self.record_key(id);
        match self.get_object(&key).await? {
            Some(content) => Ok(Some(Self::parse_record(&key, &content)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, state: &AppliedState) -> Result<()> {
        let _guard = self.key_locks.lock(&state.id).await;
        let key = self.record_key(&state.id);

        let stored = match self.get_object(&key).await? {
            Some(content) => Some(Self::parse_record(&key, &content)?),
            None => None,
        };
        check_revision(stored.as_ref(), state)?;

        let content = serde_json::to_string_pretty(state)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;

        self.put_object(&key, &content).await?;
        debug!(id = %state.id, revision = state.revision, "State record saved to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn remove(&self, id: &ResourceId) -> Result<()> {
        let _guard = self.key_locks.lock(id).await;
        // DeleteObject succeeds for missing keys.
        self.delete_object(&self.record_key(id)).await
    }

    async fn list_all(&self) -> Result<Vec<AppliedState>> {
        let keys = self.list_record_keys().await?;
        let mut records = Vec::with_capacity(keys.len());

        for key in keys {
            if let Some(content) = self.get_object(&key).await? {
                records.push(Self::parse_record(&key, &content)?);
            }
        }

        records.sort_by(|a, b| a.id.cmp(&b.id));
        info!(
            "Loaded {} state records from s3://{}/{}",
            records.len(),
            self.bucket,
            self.prefix
        );
        Ok(records)
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.lock_key();

        if let Some(content) = self.get_object(&key).await? {
            let existing = Self::parse_lock(&content)?;
            if !existing.is_expired() {
                return Err(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }
                .into());
            }
            debug!("Expired lock found, taking over");
        }

        let lock_info = LockInfo::new(&holder_or_generated(holder));
        let content = serde_json::to_string_pretty(&lock_info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;

        self.put_object(&key, &content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        let key = self.lock_key();

        if let Some(content) = self.get_object(&key).await? {
            let existing = Self::parse_lock(&content)?;
            if existing.lock_id == lock_id {
                self.delete_object(&key).await?;
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
        match self.get_object(&self.lock_key()).await? {
            Some(content) => Ok(Some(Self::parse_lock(&content)?)),
            None => Ok(None),
        }
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("team/prod/")), "team/prod/");
        assert_eq!(normalize_prefix(Some("/team")), "team/");
    }
}
