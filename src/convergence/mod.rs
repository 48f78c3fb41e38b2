//! Convergence of the artifacts derived from a target.
//!
//! Four artifacts are kept in step with the source certificate: the key-set
//! object, the serving configuration, the serving workload and its network
//! endpoint. Every operation reads the current object, compares it with the
//! desired state and writes only on difference, so repeated passes are
//! idempotent and an object deleted out-of-band is simply recreated.

use crate::config::NginxConfig;
use crate::constants::{LABEL_APP, LABEL_JWKS_CONFIG, LABEL_MANAGED_BY, LABEL_MANAGED_BY_VALUE};
use crate::jwks::JwksError;
use crate::prelude::*;
use crate::store::resources::Labels;
use crate::store::{ResourceKind, ResourceStore, StoreError};
use crate::target::JwksTarget;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

mod endpoint;
mod keyset;
mod serving_config;
mod workload;

pub use endpoint::build_endpoint;
pub(crate) use endpoint::find_workload;
pub use keyset::key_set_config_map;
pub use serving_config::render_serving_config;
pub use workload::{build_workload, content_hash, WorkloadChange};

/// An error that can arise converging a derived artifact.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConvergenceError {
    /// A store call failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The key set could not be serialized or parsed.
    #[error(transparent)]
    Jwks(#[from] JwksError),

    /// The key-set object exists but carries no `jwks.json` entry.
    #[error("jwks.json not found in ConfigMap {namespace}/{name}")]
    MissingKeySetEntry {
        /// Namespace of the key-set object.
        namespace: String,
        /// Name of the key-set object.
        name: String,
    },

    /// The desired state cannot be derived from the target's settings.
    #[error("{0}")]
    InvalidConfiguration(String),

    /// A companion object the artifact depends on does not exist.
    #[error("{kind} {namespace}/{name} not found")]
    ArtifactNotFound {
        /// Kind of the missing object.
        kind: ResourceKind,
        /// Namespace of the missing object.
        namespace: String,
        /// Name of the missing object.
        name: String,
    },
}

impl ConvergenceError {
    /// Whether the error stems from a missing object.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Store(e) => e.is_not_found(),
            Self::ArtifactNotFound { .. } => true,
            _ => false,
        }
    }
}

/// Converges the artifacts of one target at a time against a [`ResourceStore`].
///
/// Holds no per-target state; one manager serves every target.
#[derive(Clone)]
pub struct ConvergenceManager {
    store: Arc<dyn ResourceStore>,
    nginx: NginxConfig,
}

impl fmt::Debug for ConvergenceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConvergenceManager")
            .field("nginx", &self.nginx)
            .finish_non_exhaustive()
    }
}

impl ConvergenceManager {
    /// Creates a manager writing through `store` with the given workload settings.
    pub fn new(store: Arc<dyn ResourceStore>, nginx: NginxConfig) -> Self {
        Self { store, nginx }
    }

    /// Removes the artifacts of a deleted target.
    ///
    /// The workload and the endpoint are always deleted. The key-set and
    /// serving-configuration objects are deleted only when
    /// `delete_storage_objects` is set. Every deletion is best effort: failures
    /// are logged and the remaining deletions still run. Objects that are
    /// already gone count as deleted.
    pub async fn cleanup(&self, target: &JwksTarget, delete_storage_objects: bool) {
        let namespace = target.namespace();
        let name = target.name();

        log_cleanup(
            ResourceKind::Service,
            namespace,
            name,
            self.store.delete_service(namespace, name).await,
        );
        log_cleanup(
            ResourceKind::Deployment,
            namespace,
            name,
            self.store.delete_deployment(namespace, name).await,
        );

        if !delete_storage_objects {
            return;
        }

        let mut storage_objects = vec![target.spec.config_map_name.as_str()];
        storage_objects.extend(target.serving_config_name());
        for object in storage_objects.into_iter().filter(|n| !n.is_empty()) {
            log_cleanup(
                ResourceKind::ConfigMap,
                namespace,
                object,
                self.store.delete_config_map(namespace, object).await,
            );
        }
    }
}

fn log_cleanup(kind: ResourceKind, namespace: &str, name: &str, result: Result<(), StoreError>) {
    match result {
        Ok(()) => info!("Deleted {kind}: namespace={namespace}, name={name}"),
        Err(e) if e.is_not_found() => {
            debug!("{kind} already deleted: namespace={namespace}, name={name}")
        }
        Err(e) => warn!("Failed to delete {kind}: namespace={namespace}, name={name}, error={e}"),
    }
}

/// Labels carried by every object owned by the target named `target`.
pub(crate) fn owned_labels(target: &str) -> Labels {
    [
        (LABEL_APP, target),
        (LABEL_JWKS_CONFIG, target),
        (LABEL_MANAGED_BY, LABEL_MANAGED_BY_VALUE),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

/// Returns `Ok(None)` for a not-found store error.
pub(crate) fn found<T>(result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(object) => Ok(Some(object)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
