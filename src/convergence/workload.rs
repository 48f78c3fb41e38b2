use crate::config::NginxConfig;
use crate::constants::{
    ANNOTATION_JWKS_HASH, ANNOTATION_RESTARTED_AT, ANNOTATION_SERVING_CONFIG_HASH,
    CONFIG_MAP_KEY_JWKS, HEALTH_CHECK_PATH, JWKS_ENDPOINT_PATH, JWKS_MOUNT_PATH, LABEL_APP,
    LABEL_JWKS_CONFIG, LIVENESS_INITIAL_DELAY_SECONDS, LIVENESS_PERIOD_SECONDS,
    READINESS_INITIAL_DELAY_SECONDS, READINESS_PERIOD_SECONDS, SERVING_CONFIG_MOUNT_PATH,
    SERVING_CONTAINER_NAME, SERVING_PORT_NAME, VOLUME_JWKS_DATA, VOLUME_SERVING_CONFIG,
};
use crate::convergence::{found, owned_labels, ConvergenceError, ConvergenceManager};
use crate::prelude::*;
use crate::store::resources::{
    ConfigMap, Container, ContainerPort, Deployment, DeploymentSpec, HttpProbe, Labels,
    ObjectMeta, PodTemplate, ResourceList, ResourceRequirements, Volume, VolumeMount,
};
use crate::store::ResourceKind;
use crate::target::JwksTarget;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Outcome of [`ConvergenceManager::ensure_workload`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WorkloadChange {
    /// The workload did not exist and was created.
    Created,
    /// The workload drifted and was updated with a restart marker.
    Updated,
    /// The workload already matched.
    Unchanged,
}

/// Content hash of a config map: SHA-256, lowercase hex, over `key=value\n`
/// lines of text data followed by binary data, each in key order.
pub fn content_hash(config_map: &ConfigMap) -> String {
    let mut hasher = Sha256::new();
    for (k, v) in &config_map.data {
        hash_line(&mut hasher, k, v.as_bytes());
    }
    for (k, v) in &config_map.binary_data {
        hash_line(&mut hasher, k, v);
    }
    hex::encode(hasher.finalize())
}

fn hash_line(hasher: &mut Sha256, key: &str, value: &[u8]) {
    hasher.update(key.as_bytes());
    hasher.update(b"=");
    hasher.update(value);
    hasher.update(b"\n");
}

fn resource_requirements(nginx: &NginxConfig) -> ResourceRequirements {
    let requests = &nginx.resources.requests;
    let limits = &nginx.resources.limits;
    ResourceRequirements {
        requests: ResourceList {
            cpu: requests.cpu.clone(),
            memory: requests.memory.clone(),
        },
        limits: ResourceList {
            cpu: limits.cpu.clone(),
            memory: limits.memory.clone(),
        },
    }
}

fn pod_labels(target: &str) -> Labels {
    [(LABEL_APP, target), (LABEL_JWKS_CONFIG, target)]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Builds the serving workload of `target`.
///
/// `serving_config_hash` and `key_set_hash` are recorded on the pod template;
/// see [`content_hash`].
pub fn build_workload(
    target: &JwksTarget,
    serving_config_name: &str,
    serving_config_hash: String,
    key_set_hash: String,
    nginx: &NginxConfig,
) -> Deployment {
    let name = target.name();
    let container = Container {
        name: SERVING_CONTAINER_NAME.to_string(),
        image: nginx.image.clone(),
        command: ["nginx", "-g", "daemon off;"]
            .into_iter()
            .map(String::from)
            .collect(),
        ports: vec![ContainerPort {
            name: SERVING_PORT_NAME.to_string(),
            container_port: nginx.port,
        }],
        resources: resource_requirements(nginx),
        liveness_probe: Some(HttpProbe {
            path: HEALTH_CHECK_PATH.to_string(),
            port: SERVING_PORT_NAME.to_string(),
            initial_delay_seconds: LIVENESS_INITIAL_DELAY_SECONDS,
            period_seconds: LIVENESS_PERIOD_SECONDS,
        }),
        readiness_probe: Some(HttpProbe {
            path: JWKS_ENDPOINT_PATH.to_string(),
            port: SERVING_PORT_NAME.to_string(),
            initial_delay_seconds: READINESS_INITIAL_DELAY_SECONDS,
            period_seconds: READINESS_PERIOD_SECONDS,
        }),
        volume_mounts: vec![
            VolumeMount {
                name: VOLUME_SERVING_CONFIG.to_string(),
                mount_path: SERVING_CONFIG_MOUNT_PATH.to_string(),
                sub_path: None,
                read_only: true,
            },
            VolumeMount {
                name: VOLUME_JWKS_DATA.to_string(),
                mount_path: JWKS_MOUNT_PATH.to_string(),
                sub_path: Some(CONFIG_MAP_KEY_JWKS.to_string()),
                read_only: true,
            },
        ],
    };

    let annotations = [
        (ANNOTATION_SERVING_CONFIG_HASH.to_string(), serving_config_hash),
        (ANNOTATION_JWKS_HASH.to_string(), key_set_hash),
    ]
    .into_iter()
    .collect();

    Deployment {
        metadata: ObjectMeta::new(target.namespace(), name).with_labels(owned_labels(name)),
        spec: DeploymentSpec {
            replicas: nginx.replicas,
            selector: pod_labels(name),
            template: PodTemplate {
                labels: pod_labels(name),
                annotations,
                containers: vec![container],
                volumes: vec![
                    Volume {
                        name: VOLUME_SERVING_CONFIG.to_string(),
                        config_map: serving_config_name.to_string(),
                    },
                    Volume {
                        name: VOLUME_JWKS_DATA.to_string(),
                        config_map: target.spec.config_map_name.clone(),
                    },
                ],
            },
        },
        ..Deployment::default()
    }
}

/// Brings an existing workload in line with the desired hashes, volume
/// sources and resources. Returns whether anything changed.
fn reconcile_template(
    deployment: &mut Deployment,
    serving_config_name: &str,
    key_set_name: &str,
    hashes: [(&str, String); 2],
    resources: ResourceRequirements,
) -> bool {
    let template = &mut deployment.spec.template;
    let mut changed = false;

    for (annotation, hash) in hashes {
        if template.annotations.get(annotation) != Some(&hash) {
            template.annotations.insert(annotation.to_string(), hash);
            changed = true;
        }
    }

    for volume in &mut template.volumes {
        let desired = match volume.name.as_str() {
            VOLUME_SERVING_CONFIG => serving_config_name,
            VOLUME_JWKS_DATA => key_set_name,
            _ => continue,
        };
        if volume.config_map != desired {
            volume.config_map = desired.to_string();
            changed = true;
        }
    }

    if let Some(container) = template.containers.first_mut() {
        if container.resources != resources {
            container.resources = resources;
            changed = true;
        }
    }

    changed
}

fn restart_marker(now: OffsetDateTime) -> String {
    now.replace_nanosecond(0)
        .unwrap_or(now)
        .format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

impl ConvergenceManager {
    async fn required_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ConfigMap, ConvergenceError> {
        found(self.store.get_config_map(namespace, name).await)?.ok_or_else(|| {
            ConvergenceError::ArtifactNotFound {
                kind: ResourceKind::ConfigMap,
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        })
    }

    /// Ensures the serving workload exists and reloads on content changes.
    ///
    /// Both mounted objects must exist. Their content hashes are compared
    /// with the ones recorded on the pod template; any difference in hashes,
    /// volume sources or container resources updates the workload and stamps
    /// the restart marker with `now`, because mounted content alone does not
    /// make the serving process reload.
    pub async fn ensure_workload(
        &self,
        target: &JwksTarget,
        now: OffsetDateTime,
    ) -> Result<WorkloadChange, ConvergenceError> {
        let namespace = target.namespace();
        let name = target.name();
        let serving_config_name = target.serving_config_name().ok_or_else(|| {
            ConvergenceError::InvalidConfiguration(
                "nginx ConfigMap name cannot be empty".to_string(),
            )
        })?;
        let key_set_name = target.spec.config_map_name.as_str();

        let existing = found(self.store.get_deployment(namespace, name).await)?;

        let serving_config = self.required_config_map(namespace, serving_config_name).await?;
        let key_set = self.required_config_map(namespace, key_set_name).await?;
        let serving_config_hash = content_hash(&serving_config);
        let key_set_hash = content_hash(&key_set);

        let Some(mut deployment) = existing else {
            let deployment = build_workload(
                target,
                serving_config_name,
                serving_config_hash,
                key_set_hash,
                &self.nginx,
            );
            self.store.create_deployment(&deployment).await?;
            info!("nginx Deployment created: namespace={namespace}, name={name}");
            return Ok(WorkloadChange::Created);
        };

        let changed = reconcile_template(
            &mut deployment,
            serving_config_name,
            key_set_name,
            [
                (ANNOTATION_SERVING_CONFIG_HASH, serving_config_hash),
                (ANNOTATION_JWKS_HASH, key_set_hash),
            ],
            resource_requirements(&self.nginx),
        );
        if !changed {
            debug!("nginx Deployment up to date: namespace={namespace}, name={name}");
            return Ok(WorkloadChange::Unchanged);
        }

        deployment
            .spec
            .template
            .annotations
            .insert(ANNOTATION_RESTARTED_AT.to_string(), restart_marker(now));
        self.store.update_deployment(&deployment).await?;
        info!("nginx Deployment updated, rolling restart triggered: namespace={namespace}, name={name}");
        Ok(WorkloadChange::Updated)
    }
}
