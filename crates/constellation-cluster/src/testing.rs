//! In-memory object store for tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;

use crate::crd::{
    NodeVersion, NodeVersionCondition, NodeVersionSpec, NodeVersionStatus, CONDITION_OUTDATED,
    NODE_VERSION_NAME,
};
use crate::store::{ClusterStore, StoreError};

type Tamper = Box<dyn Fn(&mut NodeVersion) + Send + Sync>;

/// Store with resource versions, injectable conflicts and write tampering
#[derive(Default)]
pub(crate) struct MemoryStore {
    node_version: Mutex<Option<NodeVersion>>,
    config_maps: Mutex<BTreeMap<String, ConfigMap>>,
    revision: AtomicUsize,
    conflicts: AtomicUsize,
    failing_config_map_updates: AtomicUsize,
    node_version_writes: AtomicUsize,
    tamper: Mutex<Option<Tamper>>,
}

impl MemoryStore {
    pub(crate) fn with_node_version(spec: NodeVersionSpec, status: Option<NodeVersionStatus>) -> Self {
        let store = Self::default();
        let mut nv = NodeVersion::new(NODE_VERSION_NAME, spec);
        nv.status = status;
        nv.metadata.resource_version = Some(store.next_revision());
        *store.node_version.lock().unwrap() = Some(nv);
        store
    }

    /// Fail the next `n` NodeVersion writes with a conflict
    pub(crate) fn conflict_next(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` ConfigMap updates with an API error
    pub(crate) fn fail_config_map_updates(&self, n: usize) {
        self.failing_config_map_updates.store(n, Ordering::SeqCst);
    }

    /// Alter every stored NodeVersion after it was written
    pub(crate) fn tamper_writes(&self, f: impl Fn(&mut NodeVersion) + Send + Sync + 'static) {
        *self.tamper.lock().unwrap() = Some(Box::new(f));
    }

    pub(crate) fn node_version_writes(&self) -> usize {
        self.node_version_writes.load(Ordering::SeqCst)
    }

    pub(crate) fn stored_node_version(&self) -> NodeVersion {
        self.node_version.lock().unwrap().clone().unwrap()
    }

    pub(crate) fn config_map(&self, name: &str) -> Option<ConfigMap> {
        self.config_maps.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn insert_config_map(&self, mut cm: ConfigMap) {
        cm.metadata.resource_version = Some(self.next_revision());
        let name = cm.metadata.name.clone().unwrap();
        self.config_maps.lock().unwrap().insert(name, cm);
    }

    fn next_revision(&self) -> String {
        (self.revision.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub(crate) fn outdated() -> NodeVersionStatus {
    NodeVersionStatus {
        conditions: vec![NodeVersionCondition {
            type_: CONDITION_OUTDATED.to_string(),
            status: "True".to_string(),
            ..Default::default()
        }],
        active_cluster_version_upgrade: false,
    }
}

fn cm_name(cm: &ConfigMap) -> String {
    cm.metadata.name.clone().unwrap_or_default()
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_node_version(&self) -> Result<NodeVersion, StoreError> {
        self.node_version
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| StoreError::NotFound {
                kind: "NodeVersion",
                name: NODE_VERSION_NAME.to_string(),
            })
    }

    async fn update_node_version(&self, node_version: &NodeVersion) -> Result<NodeVersion, StoreError> {
        let conflict = || StoreError::Conflict {
            kind: "NodeVersion",
            name: NODE_VERSION_NAME.to_string(),
        };
        if Self::take(&self.conflicts) {
            // someone else wrote in between
            let mut guard = self.node_version.lock().unwrap();
            if let Some(current) = guard.as_mut() {
                current.metadata.resource_version = Some(self.next_revision());
            }
            return Err(conflict());
        }

        let mut guard = self.node_version.lock().unwrap();
        let current = guard.as_ref().ok_or_else(|| StoreError::NotFound {
            kind: "NodeVersion",
            name: NODE_VERSION_NAME.to_string(),
        })?;
        if current.metadata.resource_version != node_version.metadata.resource_version {
            return Err(conflict());
        }

        let mut written = node_version.clone();
        written.metadata.resource_version = Some(self.next_revision());
        if let Some(tamper) = self.tamper.lock().unwrap().as_ref() {
            tamper(&mut written);
        }
        *guard = Some(written.clone());
        self.node_version_writes.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }

    async fn get_config_map(&self, name: &str) -> Result<ConfigMap, StoreError> {
        self.config_map(name).ok_or_else(|| StoreError::NotFound {
            kind: "ConfigMap",
            name: name.to_string(),
        })
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let name = cm_name(config_map);
        let mut maps = self.config_maps.lock().unwrap();
        if maps.contains_key(&name) {
            return Err(StoreError::AlreadyExists {
                kind: "ConfigMap",
                name,
            });
        }
        let mut created = config_map.clone();
        created.metadata.resource_version = Some(self.next_revision());
        maps.insert(name, created.clone());
        Ok(created)
    }

    async fn update_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let name = cm_name(config_map);
        if Self::take(&self.failing_config_map_updates) {
            return Err(StoreError::Api {
                kind: "ConfigMap",
                name,
                code: Some(503),
                message: "the server is currently unable to handle the request".to_string(),
            });
        }
        let mut maps = self.config_maps.lock().unwrap();
        let current = maps.get(&name).ok_or_else(|| StoreError::NotFound {
            kind: "ConfigMap",
            name: name.clone(),
        })?;
        if current.metadata.resource_version != config_map.metadata.resource_version {
            return Err(StoreError::Conflict {
                kind: "ConfigMap",
                name,
            });
        }
        let mut written = config_map.clone();
        written.metadata.resource_version = Some(self.next_revision());
        maps.insert(name, written.clone());
        Ok(written)
    }

    async fn delete_config_map(&self, name: &str) -> Result<(), StoreError> {
        self.config_maps.lock().unwrap().remove(name);
        Ok(())
    }
}
