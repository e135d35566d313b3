//! Persisted mount configuration with serialized writers.

use crate::azure_config::{merge_and_validate, AzureConfig, ConfigPatch, ConfigView, StoredConfig, CONFIG_PATH};
use crate::storage::{get_json, put_json, Storage};
use crate::{AzSecretsError, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Reads and writes the `config` record.
///
/// Every read-merge-write cycle (configuration writes and rotation commits)
/// runs under one mutex, so writers within a process never interleave.
pub struct ConfigStore {
    storage: Arc<dyn Storage>,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            write_lock: Mutex::new(()),
        }
    }

    /// Loads the stored record, `None` when nothing is stored.
    pub async fn load(&self) -> Result<Option<StoredConfig>> {
        get_json(self.storage.as_ref(), CONFIG_PATH).await
    }

    /// Loads and validates the stored record. An absent record validates as
    /// the zero configuration.
    pub async fn load_validated(&self) -> Result<AzureConfig> {
        let stored = self.load().await?.unwrap_or_default();
        AzureConfig::from_stored(&stored)
    }

    /// Read view; the zero view when nothing is stored.
    pub async fn read(&self) -> Result<ConfigView> {
        Ok(self
            .load()
            .await?
            .map(|s| ConfigView::from(&s))
            .unwrap_or_default())
    }

    /// Merges `patch` onto the stored record (onto the zero record when
    /// `is_create` or nothing is stored), validates and persists it.
    ///
    /// Nothing is written when validation fails.
    pub async fn create_or_update(&self, patch: &ConfigPatch, is_create: bool) -> Result<ConfigView> {
        let _guard = self.write_lock.lock().await;

        let base = if is_create {
            StoredConfig::default()
        } else {
            self.load().await?.unwrap_or_default()
        };

        let (next, validated) = merge_and_validate(&base, patch)?;
        put_json(self.storage.as_ref(), CONFIG_PATH, &next).await?;

        info!(
            create = is_create,
            auth = ?validated.auth,
            environment = %next.environment,
            "configuration written"
        );
        Ok(ConfigView::from(&next))
    }

    /// Removes the record.
    pub async fn delete(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.storage.delete(CONFIG_PATH).await?;
        info!("configuration deleted");
        Ok(())
    }

    /// Replaces the static root secret after a rotation.
    ///
    /// Fails with [`AzSecretsError::InvalidConfiguration`] when the stored
    /// configuration no longer uses static-secret authentication for
    /// `expected_client_id`. Returns the key id of the password it replaced,
    /// if one was recorded.
    pub async fn commit_root_secret(
        &self,
        expected_client_id: &str,
        secret: &str,
        key_id: &str,
    ) -> Result<Option<String>> {
        let _guard = self.write_lock.lock().await;

        let mut stored = self.load().await?.unwrap_or_default();
        let current = AzureConfig::from_stored(&stored)?;
        if current.root_client_id() != Some(expected_client_id) {
            return Err(AzSecretsError::invalid(
                "configuration changed during rotation, root client is no longer in use",
            ));
        }

        let previous = current.root_password_key_id;
        stored.client_secret = secret.to_string();
        stored.root_password_key_id = key_id.to_string();
        put_json(self.storage.as_ref(), CONFIG_PATH, &stored).await?;

        debug!(key_id, previous_key_id = ?previous, "root secret committed");
        Ok(previous)
    }
}
