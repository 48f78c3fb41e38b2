use crate::constants::{LABEL_APP, LEGACY_WORKLOAD_PREFIX, SERVICE_PORT, SERVING_PORT_NAME};
use crate::convergence::{found, owned_labels, ConvergenceError, ConvergenceManager};
use crate::prelude::*;
use crate::store::resources::{Deployment, Labels, ObjectMeta, Service, ServicePort, ServiceSpec};
use crate::store::{ResourceStore, StoreError};
use crate::target::JwksTarget;

const SERVICE_TYPE_CLUSTER_IP: &str = "ClusterIP";

fn app_selector(app: &str) -> Labels {
    [(LABEL_APP.to_string(), app.to_string())].into_iter().collect()
}

/// Builds the serving endpoint of the target named `name`.
pub fn build_endpoint(namespace: &str, name: &str, target_port: u16) -> Service {
    Service {
        metadata: ObjectMeta::new(namespace, name).with_labels(owned_labels(name)),
        spec: ServiceSpec {
            service_type: SERVICE_TYPE_CLUSTER_IP.to_string(),
            selector: app_selector(name),
            ports: vec![ServicePort {
                name: SERVING_PORT_NAME.to_string(),
                port: SERVICE_PORT,
                target_port,
            }],
        },
    }
}

/// Selector the endpoint must carry to reach the workload's instances.
///
/// Uses the `app` label of the workload's pod template when there is one,
/// else the target name.
fn desired_selector(target_name: &str, workload: Option<&Deployment>) -> Labels {
    let app = workload
        .and_then(|d| d.spec.template.labels.get(LABEL_APP))
        .filter(|app| !app.is_empty())
        .map_or(target_name, String::as_str);
    app_selector(app)
}

/// Finds the serving workload of the target named `name`, by that name first
/// and then by the legacy `nginx-<name>` name.
pub(crate) async fn find_workload(
    store: &dyn ResourceStore,
    namespace: &str,
    name: &str,
) -> Result<Option<Deployment>, StoreError> {
    if let Some(deployment) = found(store.get_deployment(namespace, name).await)? {
        return Ok(Some(deployment));
    }
    let legacy = format!("{LEGACY_WORKLOAD_PREFIX}{name}");
    found(store.get_deployment(namespace, &legacy).await)
}

impl ConvergenceManager {
    /// Ensures the serving endpoint exists and selects the workload's instances.
    ///
    /// An existing endpoint whose selector drifted is corrected in place.
    /// A workload that cannot be read is treated as absent.
    pub async fn ensure_endpoint(&self, target: &JwksTarget) -> Result<(), ConvergenceError> {
        let namespace = target.namespace();
        let name = target.name();

        let Some(mut service) = found(self.store.get_service(namespace, name).await)? else {
            let service = build_endpoint(namespace, name, self.nginx.port);
            self.store.create_service(&service).await?;
            info!("nginx Service created: namespace={namespace}, name={name}");
            return Ok(());
        };

        let workload = match find_workload(self.store.as_ref(), namespace, name).await {
            Ok(workload) => workload,
            Err(e) => {
                debug!("Cannot read nginx Deployment, using default selector: namespace={namespace}, name={name}, error={e}");
                None
            }
        };
        let selector = desired_selector(name, workload.as_ref());
        if service.spec.selector == selector {
            return Ok(());
        }

        warn!(
            "nginx Service selector drifted, correcting: namespace={namespace}, name={name}, selector={:?}, expected={selector:?}",
            service.spec.selector
        );
        service.spec.selector = selector;
        self.store.update_service(&service).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::test_support::{manager, target};
    use crate::store::memory::WriteOp;
    use crate::store::resources::{DeploymentSpec, PodTemplate};
    use crate::store::ResourceKind;

    fn legacy_workload(app: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta::new("ns", "nginx-issuer"),
            spec: DeploymentSpec {
                template: PodTemplate {
                    labels: app_selector(app),
                    ..PodTemplate::default()
                },
                ..DeploymentSpec::default()
            },
            ..Deployment::default()
        }
    }

    #[tokio::test]
    async fn test_creates_endpoint() {
        let (store, manager) = manager();
        manager.ensure_endpoint(&target(true)).await.unwrap();

        let service = store.service("ns", "issuer").unwrap();
        assert_eq!(service.spec.service_type, "ClusterIP");
        assert_eq!(service.spec.selector, app_selector("issuer"));
        assert_eq!(service.spec.ports[0].port, 80);
        assert_eq!(service.spec.ports[0].target_port, 80);
        assert_eq!(service.spec.ports[0].name, "http");
        assert_eq!(service.metadata.labels["managed-by"], "jwks-operator");
    }

    #[tokio::test]
    async fn test_corrects_drifted_selector() {
        let (store, manager) = manager();
        let target = target(true);
        manager.ensure_endpoint(&target).await.unwrap();

        let mut service = store.service("ns", "issuer").unwrap();
        service.spec.selector = app_selector("something-else");
        store.update_service(&service).await.unwrap();

        manager.ensure_endpoint(&target).await.unwrap();
        assert_eq!(store.service("ns", "issuer").unwrap().spec.selector, app_selector("issuer"));

        let updates = store.writes(ResourceKind::Service, WriteOp::Update);
        manager.ensure_endpoint(&target).await.unwrap();
        assert_eq!(store.writes(ResourceKind::Service, WriteOp::Update), updates);
    }

    #[tokio::test]
    async fn test_tracks_legacy_workload_labels() {
        let (store, manager) = manager();
        let target = target(true);
        manager.ensure_endpoint(&target).await.unwrap();
        store.create_deployment(&legacy_workload("nginx-issuer")).await.unwrap();

        manager.ensure_endpoint(&target).await.unwrap();
        assert_eq!(
            store.service("ns", "issuer").unwrap().spec.selector,
            app_selector("nginx-issuer")
        );
    }
}
