//! In-process [`ResourceStore`] implementation.
//!
//! Behaves like the real store where the engine can observe it: optimistic
//! version checks, generation bumps on spec changes, not-found and
//! already-exists errors. It additionally counts writes per kind and can be
//! told to fail writes of a kind, or the next few reads of a kind, which makes
//! it the backbone of the crate's tests.

use crate::store::resources::{
    selector_matches, ConfigMap, Deployment, DeploymentStatus, Labels, ObjectMeta, Pod, Secret,
    Service,
};
use crate::store::{ResourceKind, ResourceStore, StoreError};
use crate::target::{JwksTarget, TargetKey};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

type ObjectKey = (String, String);

/// Kind of write recorded by [`InMemoryStore::writes`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum WriteOp {
    /// An object was created.
    Create,
    /// An object was replaced, including status-only writes.
    Update,
    /// An object was deleted.
    Delete,
}

trait Stored: Clone {
    const KIND: ResourceKind;
    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

macro_rules! impl_stored {
    ($ty:ty, $kind:expr) => {
        impl Stored for $ty {
            const KIND: ResourceKind = $kind;
            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }
            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

impl_stored!(JwksTarget, ResourceKind::Target);
impl_stored!(Secret, ResourceKind::Secret);
impl_stored!(ConfigMap, ResourceKind::ConfigMap);
impl_stored!(Deployment, ResourceKind::Deployment);
impl_stored!(Service, ResourceKind::Service);
impl_stored!(Pod, ResourceKind::Pod);

fn key_of<T: Stored>(obj: &T) -> ObjectKey {
    (obj.meta().namespace.clone(), obj.meta().name.clone())
}

fn key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

#[derive(Debug, Default)]
struct State {
    targets: BTreeMap<ObjectKey, JwksTarget>,
    secrets: BTreeMap<ObjectKey, Secret>,
    config_maps: BTreeMap<ObjectKey, ConfigMap>,
    deployments: BTreeMap<ObjectKey, Deployment>,
    services: BTreeMap<ObjectKey, Service>,
    pods: BTreeMap<ObjectKey, Pod>,
    writes: HashMap<(ResourceKind, WriteOp), usize>,
    failing: HashSet<ResourceKind>,
    failing_reads: HashMap<ResourceKind, usize>,
    last_version: u64,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn check_writable(&self, kind: ResourceKind) -> Result<(), StoreError> {
        if self.failing.contains(&kind) {
            return Err(StoreError::Backend(format!(
                "injected write failure for {kind}"
            )));
        }
        Ok(())
    }

    fn record(&mut self, kind: ResourceKind, op: WriteOp) {
        *self.writes.entry((kind, op)).or_default() += 1;
    }

    fn create<T: Stored>(
        &mut self,
        select: fn(&mut State) -> &mut BTreeMap<ObjectKey, T>,
        obj: &T,
    ) -> Result<T, StoreError> {
        self.check_writable(T::KIND)?;
        let k = key_of(obj);
        if select(self).contains_key(&k) {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                namespace: k.0,
                name: k.1,
            });
        }

        let mut stored = obj.clone();
        stored.meta_mut().resource_version = self.next_version();
        stored.meta_mut().generation = 1;
        select(self).insert(k, stored.clone());
        self.record(T::KIND, WriteOp::Create);
        Ok(stored)
    }

    /// Replaces an object after checking its version. `merge` builds the new
    /// stored value from the current one and the caller's copy.
    fn update<T: Stored>(
        &mut self,
        select: fn(&mut State) -> &mut BTreeMap<ObjectKey, T>,
        obj: &T,
        merge: impl FnOnce(&T, &T) -> T,
    ) -> Result<T, StoreError> {
        self.check_writable(T::KIND)?;
        let k = key_of(obj);
        let Some(current) = select(self).get(&k).cloned() else {
            return Err(StoreError::not_found(T::KIND, &k.0, &k.1));
        };
        if current.meta().resource_version != obj.meta().resource_version {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                namespace: k.0,
                name: k.1,
            });
        }

        let mut stored = merge(&current, obj);
        stored.meta_mut().resource_version = self.next_version();
        select(self).insert(k, stored.clone());
        self.record(T::KIND, WriteOp::Update);
        Ok(stored)
    }

    fn delete<T: Stored>(
        &mut self,
        select: fn(&mut State) -> &mut BTreeMap<ObjectKey, T>,
        namespace: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.check_writable(T::KIND)?;
        match select(self).remove(&key(namespace, name)) {
            Some(_) => {
                self.record(T::KIND, WriteOp::Delete);
                Ok(())
            }
            None => Err(StoreError::not_found(T::KIND, namespace, name)),
        }
    }

    fn get<T: Stored>(
        &mut self,
        select: fn(&mut State) -> &mut BTreeMap<ObjectKey, T>,
        namespace: &str,
        name: &str,
    ) -> Result<T, StoreError> {
        select(self)
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::not_found(T::KIND, namespace, name))
    }

    /// [`State::get`] behind the injected read failures.
    fn read<T: Stored>(
        &mut self,
        select: fn(&mut State) -> &mut BTreeMap<ObjectKey, T>,
        namespace: &str,
        name: &str,
    ) -> Result<T, StoreError> {
        if let Some(remaining) = self.failing_reads.get_mut(&T::KIND).filter(|n| **n > 0) {
            *remaining -= 1;
            return Err(StoreError::Backend(format!(
                "injected read failure for {}",
                T::KIND
            )));
        }
        self.get(select, namespace, name)
    }

    /// Inserts without version checks or write accounting.
    fn seed<T: Stored>(
        &mut self,
        select: fn(&mut State) -> &mut BTreeMap<ObjectKey, T>,
        obj: T,
    ) -> T {
        let mut stored = obj;
        stored.meta_mut().resource_version = self.next_version();
        if stored.meta().generation == 0 {
            stored.meta_mut().generation = 1;
        }
        select(self).insert(key_of(&stored), stored.clone());
        stored
    }
}

fn targets(s: &mut State) -> &mut BTreeMap<ObjectKey, JwksTarget> {
    &mut s.targets
}
fn secrets(s: &mut State) -> &mut BTreeMap<ObjectKey, Secret> {
    &mut s.secrets
}
fn config_maps(s: &mut State) -> &mut BTreeMap<ObjectKey, ConfigMap> {
    &mut s.config_maps
}
fn deployments(s: &mut State) -> &mut BTreeMap<ObjectKey, Deployment> {
    &mut s.deployments
}
fn services(s: &mut State) -> &mut BTreeMap<ObjectKey, Service> {
    &mut s.services
}
fn pods(s: &mut State) -> &mut BTreeMap<ObjectKey, Pod> {
    &mut s.pods
}

/// Thread-safe in-memory resource store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".to_string()))
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut State) -> R) -> Option<R> {
        self.lock().ok().map(|mut state| f(&mut state))
    }

    /// Inserts or replaces a target, returning the stored copy.
    pub fn insert_target(&self, target: JwksTarget) -> Option<JwksTarget> {
        self.with_state(|s| s.seed(targets, target))
    }

    /// Inserts or replaces a secret.
    pub fn insert_secret(&self, secret: Secret) {
        self.with_state(|s| s.seed(secrets, secret));
    }

    /// Inserts or replaces a config map without counting a write.
    pub fn insert_config_map(&self, config_map: ConfigMap) {
        self.with_state(|s| s.seed(config_maps, config_map));
    }

    /// Inserts or replaces a pod.
    pub fn insert_pod(&self, pod: Pod) {
        self.with_state(|s| s.seed(pods, pod));
    }

    /// Overwrites the observed status of a deployment, if it exists.
    pub fn set_deployment_status(&self, namespace: &str, name: &str, status: DeploymentStatus) {
        self.with_state(|s| {
            if let Some(d) = s.deployments.get_mut(&key(namespace, name)) {
                d.status = status;
            }
        });
    }

    /// Removes an object out-of-band. Returns whether it existed.
    pub fn remove(&self, kind: ResourceKind, namespace: &str, name: &str) -> bool {
        let k = key(namespace, name);
        self.with_state(|s| match kind {
            ResourceKind::Target => s.targets.remove(&k).is_some(),
            ResourceKind::Secret => s.secrets.remove(&k).is_some(),
            ResourceKind::ConfigMap => s.config_maps.remove(&k).is_some(),
            ResourceKind::Deployment => s.deployments.remove(&k).is_some(),
            ResourceKind::Service => s.services.remove(&k).is_some(),
            ResourceKind::Pod => s.pods.remove(&k).is_some(),
        })
        .unwrap_or(false)
    }

    /// Makes every subsequent write of `kind` fail with [`StoreError::Backend`].
    pub fn fail_writes(&self, kind: ResourceKind, fail: bool) {
        self.with_state(|s| {
            if fail {
                s.failing.insert(kind);
            } else {
                s.failing.remove(&kind);
            }
        });
    }

    /// Makes the next `count` reads of `kind` fail with [`StoreError::Backend`].
    pub fn fail_reads(&self, kind: ResourceKind, count: usize) {
        self.with_state(|s| {
            s.failing_reads.insert(kind, count);
        });
    }

    /// Number of successful writes of `op` against `kind` so far.
    pub fn writes(&self, kind: ResourceKind, op: WriteOp) -> usize {
        self.with_state(|s| s.writes.get(&(kind, op)).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Snapshot of a target.
    pub fn target(&self, key: &TargetKey) -> Option<JwksTarget> {
        self.with_state(|s| s.get(targets, &key.namespace, &key.name).ok())
            .flatten()
    }

    /// Snapshot of a config map.
    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.with_state(|s| s.get(config_maps, namespace, name).ok())
            .flatten()
    }

    /// Snapshot of a deployment.
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.with_state(|s| s.get(deployments, namespace, name).ok())
            .flatten()
    }

    /// Snapshot of a service.
    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.with_state(|s| s.get(services, namespace, name).ok())
            .flatten()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_target(&self, key: &TargetKey) -> Result<JwksTarget, StoreError> {
        self.lock()?.read(targets, &key.namespace, &key.name)
    }

    async fn update_target(&self, target: &JwksTarget) -> Result<JwksTarget, StoreError> {
        self.lock()?.update(targets, target, |current, incoming| {
            let mut next = incoming.clone();
            next.status = current.status.clone();
            next.metadata.generation = if current.spec == incoming.spec {
                current.metadata.generation
            } else {
                current.metadata.generation + 1
            };
            next
        })
    }

    async fn update_target_status(&self, target: &JwksTarget) -> Result<JwksTarget, StoreError> {
        self.lock()?.update(targets, target, |current, incoming| {
            let mut next = current.clone();
            next.status = incoming.status.clone();
            next
        })
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError> {
        self.lock()?.read(secrets, namespace, name)
    }

    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<ConfigMap, StoreError> {
        self.lock()?.read(config_maps, namespace, name)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        self.lock()?.create(config_maps, config_map)
    }

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        self.lock()?
            .update(config_maps, config_map, |_, incoming| incoming.clone())
    }

    async fn delete_config_map(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.lock()?.delete(config_maps, namespace, name)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError> {
        self.lock()?.read(deployments, namespace, name)
    }

    async fn create_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.lock()?.create(deployments, deployment)
    }

    async fn update_deployment(&self, deployment: &Deployment) -> Result<Deployment, StoreError> {
        self.lock()?
            .update(deployments, deployment, |current, incoming| {
                let mut next = incoming.clone();
                next.status = current.status;
                next.metadata.generation = if current.spec == incoming.spec {
                    current.metadata.generation
                } else {
                    current.metadata.generation + 1
                };
                next
            })
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.lock()?.delete(deployments, namespace, name)
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Service, StoreError> {
        self.lock()?.read(services, namespace, name)
    }

    async fn create_service(&self, service: &Service) -> Result<Service, StoreError> {
        self.lock()?.create(services, service)
    }

    async fn update_service(&self, service: &Service) -> Result<Service, StoreError> {
        self.lock()?
            .update(services, service, |_, incoming| incoming.clone())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.lock()?.delete(services, namespace, name)
    }

    async fn list_pods(&self, namespace: &str, selector: &Labels) -> Result<Vec<Pod>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .pods
            .values()
            .filter(|p| p.metadata.namespace == namespace)
            .filter(|p| selector_matches(selector, &p.metadata.labels))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_map(name: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta::new("ns", name),
            ..ConfigMap::default()
        }
    }

    #[tokio::test]
    async fn test_create_then_conflicting_update() {
        let store = InMemoryStore::new();
        let created = store.create_config_map(&config_map("cm")).await.unwrap();
        assert_eq!(created.metadata.generation, 1);

        let mut first = created.clone();
        first.data.insert("k".to_string(), "v1".to_string());
        let updated = store.update_config_map(&first).await.unwrap();
        assert!(updated.metadata.resource_version > created.metadata.resource_version);

        let mut stale = created;
        stale.data.insert("k".to_string(), "v2".to_string());
        let err = store.update_config_map(&stale).await.unwrap_err();
        assert!(err.is_conflict());

        assert_eq!(store.writes(ResourceKind::ConfigMap, WriteOp::Create), 1);
        assert_eq!(store.writes(ResourceKind::ConfigMap, WriteOp::Update), 1);
    }

    #[tokio::test]
    async fn test_create_existing_fails() {
        let store = InMemoryStore::new();
        store.create_config_map(&config_map("cm")).await.unwrap();
        let err = store.create_config_map(&config_map("cm")).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_missing_objects_are_not_found() {
        let store = InMemoryStore::new();
        let err = store.get_secret("ns", "tls").await.unwrap_err();
        assert!(err.is_not_found());
        let err = store.delete_service("ns", "svc").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = InMemoryStore::new();
        store.fail_writes(ResourceKind::ConfigMap, true);
        let err = store.create_config_map(&config_map("cm")).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));

        store.fail_writes(ResourceKind::ConfigMap, false);
        assert!(store.create_config_map(&config_map("cm")).await.is_ok());
    }

    #[tokio::test]
    async fn test_injected_read_failures_are_consumed() {
        let store = InMemoryStore::new();
        store.insert_config_map(config_map("cm"));
        store.fail_reads(ResourceKind::ConfigMap, 2);

        for _ in 0..2 {
            let err = store.get_config_map("ns", "cm").await.unwrap_err();
            assert!(matches!(err, StoreError::Backend(_)));
        }
        assert!(store.get_config_map("ns", "cm").await.is_ok());
    }

    #[tokio::test]
    async fn test_target_spec_change_bumps_generation_status_write_does_not() {
        let store = InMemoryStore::new();
        let target = store
            .insert_target(JwksTarget::new("ns", "t", Default::default()))
            .unwrap();
        assert_eq!(target.metadata.generation, 1);

        let mut status_only = target.clone();
        status_only.status.key_count = 3;
        let after_status = store.update_target_status(&status_only).await.unwrap();
        assert_eq!(after_status.metadata.generation, 1);
        assert_eq!(after_status.status.key_count, 3);

        let mut spec_change = after_status.clone();
        spec_change.spec.config_map_name = "other".to_string();
        spec_change.status.key_count = 0;
        let after_spec = store.update_target(&spec_change).await.unwrap();
        assert_eq!(after_spec.metadata.generation, 2);
        // Status is not writable through the spec path.
        assert_eq!(after_spec.status.key_count, 3);
    }

    #[tokio::test]
    async fn test_list_pods_by_selector() {
        let store = InMemoryStore::new();
        let mut labels = Labels::new();
        labels.insert("app".to_string(), "t".to_string());
        store.insert_pod(Pod {
            metadata: ObjectMeta::new("ns", "t-1").with_labels(labels.clone()),
            ..Pod::default()
        });
        store.insert_pod(Pod {
            metadata: ObjectMeta::new("other", "t-2").with_labels(labels.clone()),
            ..Pod::default()
        });
        store.insert_pod(Pod {
            metadata: ObjectMeta::new("ns", "unrelated"),
            ..Pod::default()
        });

        let pods = store.list_pods("ns", &labels).await.unwrap();
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].metadata.name, "t-1");
    }
}
