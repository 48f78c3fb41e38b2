//! Models of the companion objects held by the resource store.
//!
//! These carry exactly the fields the engine reads or writes; they are not a
//! general object model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Label or annotation map with deterministic iteration order.
pub type Labels = BTreeMap<String, String>;

/// Identity and bookkeeping shared by every stored object.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    /// Namespace of the object.
    pub namespace: String,
    /// Name of the object, unique per kind and namespace.
    pub name: String,
    /// Incremented by the store whenever the desired state changes.
    pub generation: i64,
    /// Opaque version used for optimistic concurrency; zero before creation.
    pub resource_version: u64,
    /// Object labels.
    pub labels: Labels,
    /// Object annotations.
    pub annotations: Labels,
    /// Set once deletion of the object has been requested.
    #[serde(with = "time::serde::rfc3339::option")]
    pub deletion_timestamp: Option<OffsetDateTime>,
}

impl ObjectMeta {
    /// Metadata for a not-yet-created object.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Returns the same metadata with the given labels.
    pub fn with_labels(mut self, labels: Labels) -> Self {
        self.labels = labels;
        self
    }
}

/// Opaque secret data, keyed by entry name.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Secret {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Secret entries.
    pub data: BTreeMap<String, Vec<u8>>,
}

/// Plain configuration data object.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ConfigMap {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// UTF-8 entries.
    pub data: BTreeMap<String, String>,
    /// Binary entries.
    pub binary_data: BTreeMap<String, Vec<u8>>,
}

impl ConfigMap {
    /// Returns the entry `key`, looking in binary data first, then text data.
    pub fn entry(&self, key: &str) -> Option<&[u8]> {
        self.binary_data
            .get(key)
            .map(Vec::as_slice)
            .or_else(|| self.data.get(key).map(String::as_bytes))
    }
}

/// A replicated workload running the serving process.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Deployment {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    pub spec: DeploymentSpec,
    /// Observed state, maintained by the store.
    pub status: DeploymentStatus,
}

/// Desired state of a [`Deployment`].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct DeploymentSpec {
    /// Number of desired instances.
    pub replicas: i32,
    /// Labels selecting the instances owned by the workload.
    pub selector: Labels,
    /// Template every instance is created from.
    pub template: PodTemplate,
}

/// Observed state of a [`Deployment`].
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct DeploymentStatus {
    /// Instances that exist.
    pub replicas: i32,
    /// Instances that report ready.
    pub ready_replicas: i32,
    /// Instances that are available to serve.
    pub available_replicas: i32,
}

/// Instance template of a [`Deployment`].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct PodTemplate {
    /// Instance labels.
    pub labels: Labels,
    /// Instance annotations. A change here rolls the workload.
    pub annotations: Labels,
    /// Containers of every instance.
    pub containers: Vec<Container>,
    /// Volumes available to the containers.
    pub volumes: Vec<Volume>,
}

/// One container of a [`PodTemplate`].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Container {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Entry point and arguments.
    pub command: Vec<String>,
    /// Exposed ports.
    pub ports: Vec<ContainerPort>,
    /// Compute requests and limits.
    pub resources: ResourceRequirements,
    /// Restart probe.
    pub liveness_probe: Option<HttpProbe>,
    /// Traffic-admission probe.
    pub readiness_probe: Option<HttpProbe>,
    /// Volume mounts.
    pub volume_mounts: Vec<VolumeMount>,
}

/// A named container port.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ContainerPort {
    /// Port name.
    pub name: String,
    /// Port number inside the container.
    pub container_port: u16,
}

/// Compute requests and limits of a container.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ResourceRequirements {
    /// Guaranteed amounts.
    pub requests: ResourceList,
    /// Upper bounds.
    pub limits: ResourceList,
}

/// CPU and memory quantities, kept as the store's textual quantities.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ResourceList {
    /// CPU quantity, e.g. `50m`.
    pub cpu: String,
    /// Memory quantity, e.g. `64Mi`.
    pub memory: String,
}

/// HTTP GET probe.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct HttpProbe {
    /// Path requested.
    pub path: String,
    /// Name of the container port probed.
    pub port: String,
    /// Delay before the first probe, in seconds.
    pub initial_delay_seconds: u32,
    /// Interval between probes, in seconds.
    pub period_seconds: u32,
}

/// A volume projecting a [`ConfigMap`].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Volume {
    /// Volume name.
    pub name: String,
    /// Name of the projected config map.
    pub config_map: String,
}

/// A volume mount in a container.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct VolumeMount {
    /// Mounted volume name.
    pub name: String,
    /// Mount path inside the container.
    pub mount_path: String,
    /// Single entry of the volume to mount, if any.
    pub sub_path: Option<String>,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

/// Stable network endpoint in front of a workload.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Service {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Desired state.
    pub spec: ServiceSpec,
}

/// Desired state of a [`Service`].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ServiceSpec {
    /// Exposure type, e.g. `ClusterIP`.
    pub service_type: String,
    /// Labels selecting backing instances.
    pub selector: Labels,
    /// Exposed ports.
    pub ports: Vec<ServicePort>,
}

/// A port exposed by a [`Service`].
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ServicePort {
    /// Port name.
    pub name: String,
    /// Port exposed by the endpoint.
    pub port: u16,
    /// Port on the backing instance.
    pub target_port: u16,
}

/// Lifecycle phase of a [`Pod`].
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub enum PodPhase {
    /// Accepted but not started.
    #[default]
    Pending,
    /// At least one container is running.
    Running,
    /// All containers exited successfully.
    Succeeded,
    /// At least one container failed.
    Failed,
    /// State could not be obtained.
    Unknown,
}

/// A running instance of a workload.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct Pod {
    /// Object metadata.
    pub metadata: ObjectMeta,
    /// Lifecycle phase.
    pub phase: PodPhase,
    /// Whether the instance reports ready.
    pub ready: bool,
}

impl Pod {
    /// A running instance that passes its readiness checks.
    pub fn is_serving(&self) -> bool {
        self.phase == PodPhase::Running && self.ready
    }
}

/// Whether every entry of `selector` is present in `labels`.
pub fn selector_matches(selector: &Labels, labels: &Labels) -> bool {
    selector
        .iter()
        .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
}
