//! Built-in adapter managing files on the local filesystem.
//!
//! Properties:
//! - `path` (string, required): changing it forces replacement.
//! - `content` (string, default empty): updated in place.
//!
//! Outputs: `path`, `sha256` and `size`.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs;
use tracing::debug;

use crate::error::{ProviderError, ProviderResult};
use crate::model::{ExternalId, Properties, Value};

use super::adapter::{Capabilities, CurrentState, OperationContext, Provider, ProviderOutput};

/// Manages one file per resource.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileProvider;

impl LocalFileProvider {
    /// Creates the adapter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn outputs(path: &str, content: &str) -> Properties {
        let digest = hex::encode(Sha256::digest(content.as_bytes()));
        let size = i64::try_from(content.len()).unwrap_or(i64::MAX);

        let mut outputs = Properties::new();
        outputs.insert(String::from("path"), Value::string(path));
        outputs.insert(String::from("sha256"), Value::string(digest));
        outputs.insert(String::from("size"), Value::from(size));
        outputs
    }

    fn string_property<'a>(props: &'a Properties, key: &str) -> ProviderResult<Option<&'a str>> {
        match props.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(ProviderError::validation(format!(
                "'{key}' must be a string, got {other}"
            ))),
        }
    }

    async fn write(path: &str, content: &str) -> ProviderResult<()> {
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await.map_err(|e| io_error(path, &e))?;
        }
        fs::write(path, content).await.map_err(|e| io_error(path, &e))
    }
}

fn io_error(path: &str, err: &std::io::Error) -> ProviderError {
    match err.kind() {
        std::io::ErrorKind::NotFound => ProviderError::NotFound {
            external_id: path.to_string(),
        },
        std::io::ErrorKind::PermissionDenied => {
            ProviderError::validation(format!("Permission denied for {path}"))
        }
        std::io::ErrorKind::Interrupted | std::io::ErrorKind::WouldBlock => {
            ProviderError::unavailable(format!("{path}: {err}"))
        }
        _ => ProviderError::other(format!("{path}: {err}")),
    }
}

#[async_trait]
impl Provider for LocalFileProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::updatable().force_replacement("path")
    }

    async fn read(
        &self,
        _ctx: &OperationContext,
        external_id: &ExternalId,
    ) -> ProviderResult<Option<CurrentState>> {
        let path = external_id.as_str();
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(path, &e)),
        };

        let mut properties = Properties::new();
        properties.insert(String::from("path"), Value::string(path));
        properties.insert(String::from("content"), Value::string(content.as_str()));

        Ok(Some(CurrentState {
            properties,
            outputs: Self::outputs(path, &content),
        }))
    }

    async fn create(
        &self,
        ctx: &OperationContext,
        desired: &Properties,
    ) -> ProviderResult<ProviderOutput> {
        let path = Self::string_property(desired, "path")?
            .ok_or_else(|| ProviderError::validation("'path' is required"))?;
        let content = Self::string_property(desired, "content")?.unwrap_or_default();

        if fs::try_exists(path).await.unwrap_or(false) {
            return Err(ProviderError::conflict(format!("File already exists: {path}")));
        }

        Self::write(path, content).await?;
        debug!(resource = %ctx.resource, "Created file {path}");

        Ok(ProviderOutput {
            external_id: ExternalId::new(path),
            outputs: Self::outputs(path, content),
        })
    }

    async fn update(
        &self,
        ctx: &OperationContext,
        external_id: &ExternalId,
        changed: &Properties,
    ) -> ProviderResult<ProviderOutput> {
        let path = external_id.as_str();
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Err(ProviderError::NotFound {
                external_id: path.to_string(),
            });
        }

        // Only differing keys arrive; keep the current content when it is not one of them.
        let content = match Self::string_property(changed, "content")? {
            Some(content) => content.to_string(),
            None if changed.contains_key("content") => String::new(),
            None => fs::read_to_string(path).await.map_err(|e| io_error(path, &e))?,
        };

        Self::write(path, &content).await?;
        debug!(resource = %ctx.resource, "Updated file {path}");

        Ok(ProviderOutput {
            external_id: external_id.clone(),
            outputs: Self::outputs(path, &content),
        })
    }

    async fn delete(&self, ctx: &OperationContext, external_id: &ExternalId) -> ProviderResult<()> {
        let path = external_id.as_str();
        fs::remove_file(path).await.map_err(|e| io_error(path, &e))?;
        debug!(resource = %ctx.resource, "Deleted file {path}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceId;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> OperationContext {
        OperationContext::new(ResourceId::new("f1"), CancellationToken::new())
    }

    fn desired(path: &str, content: &str) -> Properties {
        let mut props = Properties::new();
        props.insert(String::from("path"), Value::string(path));
        props.insert(String::from("content"), Value::string(content));
        props
    }

    #[tokio::test]
    async fn test_file_lifecycle() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("nested/hello.txt");
        let path = path.to_string_lossy().to_string();
        let provider = LocalFileProvider::new();

        let created = provider
            .create(&ctx(), &desired(&path, "hello"))
            .await
            .expect("create");
        assert_eq!(created.external_id.as_str(), path);
        assert_eq!(created.outputs.get("size"), Some(&Value::from(5_i64)));

        let mut changed = Properties::new();
        changed.insert(String::from("content"), Value::string("hello world"));
        let updated = provider
            .update(&ctx(), &created.external_id, &changed)
            .await
            .expect("update");
        assert_ne!(updated.outputs.get("sha256"), created.outputs.get("sha256"));

        let current = provider
            .read(&ctx(), &created.external_id)
            .await
            .expect("read")
            .expect("file exists");
        assert_eq!(current.properties.get("content"), Some(&Value::string("hello world")));

        provider.delete(&ctx(), &created.external_id).await.expect("delete");
        assert!(provider.read(&ctx(), &created.external_id).await.expect("read").is_none());

        let err = provider
            .delete(&ctx(), &created.external_id)
            .await
            .expect_err("already deleted");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_rejects_existing_file() {
        let temp = TempDir::new().expect("temp dir");
        let path = temp.path().join("taken.txt");
        std::fs::write(&path, "x").expect("write");

        let err = LocalFileProvider::new()
            .create(&ctx(), &desired(&path.to_string_lossy(), "y"))
            .await
            .expect_err("conflict");
        assert!(matches!(err, ProviderError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_missing_path_is_validation_error() {
        let err = LocalFileProvider::new()
            .create(&ctx(), &Properties::new())
            .await
            .expect_err("path required");
        assert!(matches!(err, ProviderError::Validation { .. }));
        assert!(!err.is_retryable());
    }
}
