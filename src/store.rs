use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::resources::{ResourceFilter, ResourceKey, ResourceStatus, SimulatedResource, Transition};

#[derive(Debug, Clone, PartialEq)]
pub enum DeleteOutcome {
    Deleted(SimulatedResource),
    NotFound,
}

/// Resource counts by lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct StoreInner {
    resources: BTreeMap<ResourceKey, SimulatedResource>,
    // Bumped on every change to a workload record
    workload_generation: u64,
}

impl StoreInner {
    fn touch(&mut self, key: &ResourceKey) {
        if key.kind.is_workload() {
            self.workload_generation = self.workload_generation.wrapping_add(1);
        }
    }
}

/// Authoritative in-memory map of simulated resources.
///
/// One coarse lock guards the whole map; records are small and contention is
/// limited to the tick driver and completion tasks.
#[derive(Debug, Default)]
pub struct ResourceStore {
    inner: RwLock<StoreInner>,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> EngineResult<RwLockReadGuard<'_, StoreInner>> {
        self.inner.read().map_err(|_| EngineError::poisoned("resource store"))
    }

    fn write(&self) -> EngineResult<RwLockWriteGuard<'_, StoreInner>> {
        self.inner.write().map_err(|_| EngineError::poisoned("resource store"))
    }

    /// Insert or overwrite by identity. Returns the replaced record, if any.
    pub fn put(&self, resource: SimulatedResource) -> EngineResult<Option<SimulatedResource>> {
        let key = resource.key();
        let mut inner = self.write()?;
        inner.touch(&key);
        Ok(inner.resources.insert(key, resource))
    }

    pub fn get(&self, key: &ResourceKey) -> EngineResult<Option<SimulatedResource>> {
        Ok(self.read()?.resources.get(key).cloned())
    }

    /// Copy of every matching record, ordered by identity.
    pub fn list(&self, filter: &ResourceFilter) -> EngineResult<Vec<SimulatedResource>> {
        Ok(self
            .read()?
            .resources
            .iter()
            .filter(|(key, _)| filter.matches(key))
            .map(|(_, resource)| resource.clone())
            .collect())
    }

    pub fn delete(&self, key: &ResourceKey) -> EngineResult<DeleteOutcome> {
        let mut inner = self.write()?;
        match inner.resources.remove(key) {
            Some(resource) => {
                inner.touch(key);
                Ok(DeleteOutcome::Deleted(resource))
            }
            None => Ok(DeleteOutcome::NotFound),
        }
    }

    /// Keys of every kind sharing `(namespace, name)`.
    pub fn keys_named(&self, namespace: &str, name: &str) -> EngineResult<Vec<ResourceKey>> {
        Ok(self
            .read()?
            .resources
            .keys()
            .filter(|key| key.namespace == namespace && key.name == name)
            .cloned()
            .collect())
    }

    /// Apply a terminal transition to the record with this `uid`.
    ///
    /// Returns `false` when the record is gone, was replaced by a newer
    /// deployment, or already reached a terminal state.
    pub fn complete(
        &self,
        key: &ResourceKey,
        uid: Uuid,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let mut inner = self.write()?;
        let applied = match inner.resources.get_mut(key) {
            Some(resource) if resource.uid == uid => resource.complete(transition, now),
            _ => false,
        };
        if applied {
            inner.touch(key);
        }
        Ok(applied)
    }

    pub fn workload_generation(&self) -> EngineResult<u64> {
        Ok(self.read()?.workload_generation)
    }

    /// Running Deployment/StatefulSet records, the services telemetry is
    /// generated for.
    pub fn running_workloads(&self) -> EngineResult<Vec<SimulatedResource>> {
        Ok(self
            .read()?
            .resources
            .values()
            .filter(|r| r.kind.is_workload() && r.status == ResourceStatus::Running)
            .cloned()
            .collect())
    }

    pub fn status_counts(&self) -> EngineResult<StatusCounts> {
        let inner = self.read()?;
        let mut counts = StatusCounts {
            total: inner.resources.len(),
            ..StatusCounts::default()
        };
        for resource in inner.resources.values() {
            match resource.status {
                ResourceStatus::Pending => counts.pending += 1,
                ResourceStatus::Running => counts.running += 1,
                ResourceStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    pub fn len(&self) -> EngineResult<usize> {
        Ok(self.read()?.resources.len())
    }

    pub fn is_empty(&self) -> EngineResult<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ResourceDeclaration, ResourceKind};
    use serde_json::json;

    fn resource(kind: ResourceKind, name: &str) -> SimulatedResource {
        let decl = ResourceDeclaration {
            kind,
            name: name.to_string(),
            namespace: "default".to_string(),
            labels: Default::default(),
            spec: json!({ "replicas": 2 }),
        };
        SimulatedResource::pending(&decl, Utc::now())
    }

    #[test]
    fn test_put_overwrites_on_identity() {
        let store = ResourceStore::new();
        let first = resource(ResourceKind::Deployment, "api");
        let second = resource(ResourceKind::Deployment, "api");
        assert!(store.put(first.clone()).unwrap().is_none());
        let replaced = store.put(second.clone()).unwrap().unwrap();
        assert_eq!(replaced.uid, first.uid);
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get(&second.key()).unwrap().unwrap().uid, second.uid);
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let store = ResourceStore::new();
        let key = ResourceKey::new("default", ResourceKind::Pod, "ghost");
        assert_eq!(store.delete(&key).unwrap(), DeleteOutcome::NotFound);
    }

    #[test]
    fn test_list_filters_and_orders() {
        let store = ResourceStore::new();
        store.put(resource(ResourceKind::Service, "b")).unwrap();
        store.put(resource(ResourceKind::Deployment, "a")).unwrap();
        store.put(resource(ResourceKind::Service, "a")).unwrap();

        let services = store
            .list(&ResourceFilter {
                namespace: None,
                kind: Some(ResourceKind::Service),
            })
            .unwrap();
        let names: Vec<_> = services.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(store.list(&ResourceFilter::default()).unwrap().len(), 3);
    }

    #[test]
    fn test_complete_checks_uid_and_status() {
        let store = ResourceStore::new();
        let original = resource(ResourceKind::Deployment, "api");
        let key = original.key();
        store.put(original.clone()).unwrap();

        // Redeploy replaces the record; the stale completion must not apply
        let replacement = resource(ResourceKind::Deployment, "api");
        store.put(replacement.clone()).unwrap();
        let running = Transition::Running { node: None, cluster_ip: None };
        assert!(!store.complete(&key, original.uid, &running, Utc::now()).unwrap());
        assert!(store.complete(&key, replacement.uid, &running, Utc::now()).unwrap());
        assert!(!store.complete(&key, replacement.uid, &running, Utc::now()).unwrap());

        let counts = store.status_counts().unwrap();
        assert_eq!(counts.running, 1);
        assert_eq!(store.running_workloads().unwrap().len(), 1);
    }

    #[test]
    fn test_workload_generation_tracks_workloads_only() {
        let store = ResourceStore::new();
        let before = store.workload_generation().unwrap();
        store.put(resource(ResourceKind::ConfigMap, "cfg")).unwrap();
        assert_eq!(store.workload_generation().unwrap(), before);
        store.put(resource(ResourceKind::StatefulSet, "db")).unwrap();
        assert_eq!(store.workload_generation().unwrap(), before + 1);
    }
}
