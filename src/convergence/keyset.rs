use crate::constants::{CONFIG_MAP_KEY_JWKS, LABEL_MANAGED_BY, LABEL_MANAGED_BY_VALUE};
use crate::convergence::{found, ConvergenceError, ConvergenceManager};
use crate::jwks::rotation::remove_expired_keys;
use crate::jwks::{merge, Jwks, UpdateStrategy};
use crate::prelude::*;
use crate::store::resources::{ConfigMap, ObjectMeta};
use std::time::Duration;

/// Builds the key-set object holding `json` under `jwks.json`.
pub fn key_set_config_map(namespace: &str, name: &str, json: Vec<u8>) -> ConfigMap {
    let labels = [(LABEL_MANAGED_BY.to_string(), LABEL_MANAGED_BY_VALUE.to_string())];
    ConfigMap {
        metadata: ObjectMeta::new(namespace, name).with_labels(labels.into_iter().collect()),
        binary_data: [(CONFIG_MAP_KEY_JWKS.to_string(), json)].into_iter().collect(),
        ..ConfigMap::default()
    }
}

impl ConvergenceManager {
    /// Reads the key set stored in the key-set object.
    ///
    /// Returns `Ok(None)` if the object does not exist.
    ///
    /// # Errors
    /// - [`ConvergenceError::MissingKeySetEntry`] if the object has no `jwks.json` entry.
    /// - [`ConvergenceError::Jwks`] if the entry is not a JSON key set.
    pub async fn read_key_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Jwks>, ConvergenceError> {
        let Some(config_map) = found(self.store.get_config_map(namespace, name).await)? else {
            return Ok(None);
        };
        let bytes = config_map
            .entry(CONFIG_MAP_KEY_JWKS)
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ConvergenceError::MissingKeySetEntry {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        Ok(Some(Jwks::from_json(bytes)?))
    }

    /// Writes `jwks` into the key-set object, creating the object if needed.
    ///
    /// Returns whether the stored object changed. An object already carrying
    /// byte-identical content is left untouched.
    pub async fn write_key_set(
        &self,
        namespace: &str,
        name: &str,
        jwks: &Jwks,
    ) -> Result<bool, ConvergenceError> {
        let json = jwks.to_json()?;

        match found(self.store.get_config_map(namespace, name).await)? {
            None => {
                self.store
                    .create_config_map(&key_set_config_map(namespace, name, json))
                    .await?;
                Ok(true)
            }
            Some(mut config_map) => {
                if config_map.binary_data.get(CONFIG_MAP_KEY_JWKS) == Some(&json) {
                    return Ok(false);
                }
                config_map.data.remove(CONFIG_MAP_KEY_JWKS);
                config_map
                    .binary_data
                    .insert(CONFIG_MAP_KEY_JWKS.to_string(), json);
                self.store.update_config_map(&config_map).await?;
                Ok(true)
            }
        }
    }

    /// Applies `strategy` to publish `generated`, returning the key set now stored.
    ///
    /// The rolling strategy with `keep_old_keys` merges the stored keys with
    /// the generated ones. Old keys accumulate: expiry by `old_keys_ttl` is
    /// not applied yet because keys carry no creation time. Only a missing
    /// key-set object counts as an empty stored set; any other read failure
    /// is returned so the stored keys are never overwritten blindly. Every
    /// other combination replaces the stored set.
    ///
    /// # Errors
    /// Returns the failing read or write of the key-set object.
    pub async fn publish_key_set(
        &self,
        namespace: &str,
        name: &str,
        strategy: UpdateStrategy,
        keep_old_keys: bool,
        old_keys_ttl: Duration,
        generated: &Jwks,
    ) -> Result<Jwks, ConvergenceError> {
        let desired = match strategy {
            UpdateStrategy::Rolling if keep_old_keys => {
                let stored = self
                    .read_key_set(namespace, name)
                    .await
                    .inspect_err(|e| {
                        warn!(
                            "Failed to read stored JWKS, keeping it untouched: namespace={namespace}, config_map={name}, error={e}"
                        );
                    })?
                    .unwrap_or_default();
                let mut merged = merge(&stored, generated);
                remove_expired_keys(&mut merged, old_keys_ttl);
                merged
            }
            UpdateStrategy::Rolling | UpdateStrategy::Immediate => generated.clone(),
        };

        if self.write_key_set(namespace, name, &desired).await? {
            info!(
                "JWKS ConfigMap updated: namespace={namespace}, config_map={name}, strategy={strategy}, keys={}",
                desired.len()
            );
        } else {
            debug!("JWKS ConfigMap unchanged: namespace={namespace}, config_map={name}");
        }
        Ok(desired)
    }
}
