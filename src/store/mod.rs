//! Interface to the declarative resource store.
//!
//! The store holds targets and every companion object the engine derives
//! from them. Updates are optimistic: an object carries the
//! `resource_version` it was read at, and a write against a newer version
//! fails with [`StoreError::Conflict`]. The engine never retries a conflict
//! within a pass; the next pass re-reads and converges.

use crate::store::resources::{ConfigMap, Deployment, Labels, Pod, Secret, Service};
use crate::target::{JwksTarget, TargetKey};
use async_trait::async_trait;
use std::fmt;

pub mod memory;
pub mod resources;

/// Kind of object addressed by a store call.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ResourceKind {
    /// A JWKS target.
    Target,
    /// A source secret.
    Secret,
    /// A key-set or serving-configuration object.
    ConfigMap,
    /// The serving workload.
    Deployment,
    /// The serving endpoint.
    Service,
    /// A workload instance.
    Pod,
}

impl ResourceKind {
    /// Returns a stable string representation of the kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Target => "JWKS",
            Self::Secret => "Secret",
            Self::ConfigMap => "ConfigMap",
            Self::Deployment => "Deployment",
            Self::Service => "Service",
            Self::Pod => "Pod",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by a [`ResourceStore`].
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StoreError {
    /// The addressed object does not exist.
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Kind of the object.
        kind: ResourceKind,
        /// Namespace of the object.
        namespace: String,
        /// Name of the object.
        name: String,
    },

    /// A create addressed an object that already exists.
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Kind of the object.
        kind: ResourceKind,
        /// Namespace of the object.
        namespace: String,
        /// Name of the object.
        name: String,
    },

    /// An update was based on a stale version of the object.
    #[error("conflict updating {kind} {namespace}/{name}: the object has been modified")]
    Conflict {
        /// Kind of the object.
        kind: ResourceKind,
        /// Namespace of the object.
        namespace: String,
        /// Name of the object.
        name: String,
    },

    /// Any other failure of the backing store.
    #[error("resource store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub(crate) fn not_found(kind: ResourceKind, namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Whether the addressed object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Narrow view of the resource store consumed by the engine.
///
/// Every call is a suspension point; implementations must be safe to share
/// between concurrently reconciled targets.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Reads a target.
    async fn get_target(&self, key: &TargetKey) -> Result<JwksTarget, StoreError>;

    /// Writes a target's metadata and spec. Status is left untouched.
    async fn update_target(&self, target: &JwksTarget) -> Result<JwksTarget, StoreError>;

    /// Writes a target's status. Metadata and spec are left untouched.
    async fn update_target_status(&self, target: &JwksTarget) -> Result<JwksTarget, StoreError>;

    /// Reads a secret.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError>;

    /// Reads a config map.
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError>;

    /// Creates a config map.
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError>;

    /// Replaces a config map.
    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError>;

    /// Deletes a config map.
    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Reads a deployment.
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError>;

    /// Creates a deployment.
    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError>;

    /// Replaces a deployment's metadata and spec.
    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError>;

    /// Deletes a deployment.
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Reads a service.
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StoreError>;

    /// Creates a service.
    async fn create_service(&self, service: &Service) -> Result<Service, StoreError>;

    /// Replaces a service.
    async fn update_service(&self, service: &Service) -> Result<Service, StoreError>;

    /// Deletes a service.
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Lists the pods in `namespace` whose labels match every entry of `selector`.
    async fn list_pods(&self, namespace: &str, selector: &Labels) -> Result<Vec<Pod>, StoreError>;
}
