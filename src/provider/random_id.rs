//! Built-in adapter generating random identifiers.
//!
//! Properties: `byte_length` (1 to 64, default 8), `prefix` and `keepers`.
//! Every property forces a new identifier. Outputs: `hex`, `id` and
//! `byte_length`.

use async_trait::async_trait;
use rand::RngCore;

use crate::error::{ProviderError, ProviderResult};
use crate::model::{ExternalId, Properties, Value};

use super::adapter::{Capabilities, CurrentState, OperationContext, Provider, ProviderOutput};

/// Default number of random bytes.
pub const DEFAULT_BYTE_LENGTH: i64 = 8;

/// Largest accepted number of random bytes.
const MAX_BYTE_LENGTH: i64 = 64;

/// Generates identifiers. Nothing exists outside the state record.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdProvider;

impl RandomIdProvider {
    /// Creates the adapter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn byte_length(desired: &Properties) -> ProviderResult<usize> {
        let length = match desired.get("byte_length") {
            None | Some(Value::Null) => DEFAULT_BYTE_LENGTH,
            Some(value) => value.as_i64().ok_or_else(|| {
                ProviderError::validation(format!("'byte_length' must be an integer, got {value}"))
            })?,
        };

        if !(1..=MAX_BYTE_LENGTH).contains(&length) {
            return Err(ProviderError::validation(format!(
                "'byte_length' must be between 1 and {MAX_BYTE_LENGTH}, got {length}"
            )));
        }

        usize::try_from(length).map_err(|e| ProviderError::validation(e.to_string()))
    }
}

#[async_trait]
impl Provider for RandomIdProvider {
    fn capabilities(&self) -> Capabilities {
        Capabilities::immutable()
    }

    async fn read(
        &self,
        _ctx: &OperationContext,
        _external_id: &ExternalId,
    ) -> ProviderResult<Option<CurrentState>> {
        Ok(Some(CurrentState {
            properties: Properties::new(),
            outputs: Properties::new(),
        }))
    }

    async fn create(
        &self,
        _ctx: &OperationContext,
        desired: &Properties,
    ) -> ProviderResult<ProviderOutput> {
        let length = Self::byte_length(desired)?;
        let prefix = desired.get("prefix").and_then(Value::as_str).unwrap_or_default();

        let mut bytes = vec![0_u8; length];
        rand::thread_rng().fill_bytes(&mut bytes);
        let hex = hex::encode(&bytes);
        let id = format!("{prefix}{hex}");

        let mut outputs = Properties::new();
        outputs.insert(String::from("hex"), Value::string(hex));
        outputs.insert(String::from("id"), Value::string(id.as_str()));
        outputs.insert(
            String::from("byte_length"),
            Value::from(i64::try_from(length).unwrap_or(DEFAULT_BYTE_LENGTH)),
        );

        Ok(ProviderOutput {
            external_id: ExternalId::new(id),
            outputs,
        })
    }

    async fn update(
        &self,
        _ctx: &OperationContext,
        external_id: &ExternalId,
        _changed: &Properties,
    ) -> ProviderResult<ProviderOutput> {
        Err(ProviderError::validation(format!(
            "random_id '{external_id}' cannot be updated in place"
        )))
    }

    async fn delete(&self, _ctx: &OperationContext, _external_id: &ExternalId) -> ProviderResult<()> {
        Ok(())
    }
}
