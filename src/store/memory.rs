//! # In-Memory Stores
//!
//! Stores with the same versioning and conflict semantics as the Kubernetes
//! API, used to drive the reconcilers in tests without a cluster.

use crate::store::{
    ResourceStore, SecretData, SecretOwnership, SecretStore, StoreError, StoredResource, object_key,
};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

/// In-memory [`ResourceStore`]
#[derive(Debug)]
pub struct MemoryResourceStore<K> {
    objects: Mutex<BTreeMap<Key, K>>,
    version: AtomicU64,
    status_writes: AtomicUsize,
    pending_conflicts: AtomicUsize,
}

impl<K: StoredResource> Default for MemoryResourceStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StoredResource> MemoryResourceStore<K> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            version: AtomicU64::new(0),
            status_writes: AtomicUsize::new(0),
            pending_conflicts: AtomicUsize::new(0),
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn conflict(namespace: &str, name: &str) -> StoreError {
        StoreError::Conflict {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn not_found(namespace: &str, name: &str) -> StoreError {
        StoreError::NotFound {
            kind: K::kind(&()).to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Create an object as the API server would: uid, generation 1, fresh version
    pub fn create(&self, mut obj: K) -> Result<K, StoreError> {
        let (namespace, name) = object_key(&obj)?;
        let meta = obj.meta_mut();
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        meta.generation = Some(1);
        meta.resource_version = Some(self.next_version());
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key(&namespace, &name), obj.clone());
        Ok(obj)
    }

    /// Apply a spec edit: bumps generation and version, keeps status and finalizers
    pub fn update_spec(&self, namespace: &str, name: &str, edit: impl FnOnce(&mut K)) -> Result<K, StoreError> {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let obj = objects
            .get_mut(&key(namespace, name))
            .ok_or_else(|| Self::not_found(namespace, name))?;
        edit(obj);
        let meta = obj.meta_mut();
        meta.generation = Some(meta.generation.unwrap_or(0) + 1);
        meta.resource_version = Some(self.next_version());
        Ok(obj.clone())
    }

    /// Request deletion; objects without finalizers disappear immediately
    pub fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let k = key(namespace, name);
        let obj = objects
            .get_mut(&k)
            .ok_or_else(|| Self::not_found(namespace, name))?;
        if obj.meta().finalizers.as_ref().is_none_or(Vec::is_empty) {
            objects.remove(&k);
            return Ok(());
        }
        let meta = obj.meta_mut();
        if meta.deletion_timestamp.is_none() {
            meta.deletion_timestamp =
                serde_json::from_value(serde_json::Value::String(chrono::Utc::now().to_rfc3339()))?;
            meta.resource_version = Some(self.next_version());
        }
        Ok(())
    }

    /// Current copy of an object
    #[must_use]
    pub fn snapshot(&self, namespace: &str, name: &str) -> Option<K> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(namespace, name))
            .cloned()
    }

    /// Replace an object verbatim, e.g. to seed status in a test
    pub fn replace(&self, mut obj: K) -> Result<K, StoreError> {
        let (namespace, name) = object_key(&obj)?;
        obj.meta_mut().resource_version = Some(self.next_version());
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key(&namespace, &name), obj.clone());
        Ok(obj)
    }

    /// Number of successful status writes
    #[must_use]
    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    /// Make the next `count` status writes fail with a conflict
    pub fn inject_conflicts(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    fn take_injected_conflict(&self) -> bool {
        self.pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl<K: StoredResource> ResourceStore<K> for MemoryResourceStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        Ok(self.snapshot(namespace, name))
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_key(obj)?;
        if self.take_injected_conflict() {
            return Err(Self::conflict(&namespace, &name));
        }
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = objects
            .get(&key(&namespace, &name))
            .ok_or_else(|| Self::not_found(&namespace, &name))?;
        if stored.meta().resource_version != obj.meta().resource_version {
            return Err(Self::conflict(&namespace, &name));
        }

        let mut value = serde_json::to_value(stored)?;
        let incoming = serde_json::to_value(obj)?;
        value["status"] = incoming
            .get("status")
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let mut updated: K = serde_json::from_value(value)?;
        updated.meta_mut().resource_version = Some(self.next_version());
        objects.insert(key(&namespace, &name), updated.clone());
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        Ok(updated)
    }

    async fn update_finalizers(&self, obj: &K, finalizers: Vec<String>) -> Result<K, StoreError> {
        let (namespace, name) = object_key(obj)?;
        let mut objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        let k = key(&namespace, &name);
        let stored = objects
            .get_mut(&k)
            .ok_or_else(|| Self::not_found(&namespace, &name))?;
        if stored.meta().resource_version != obj.meta().resource_version {
            return Err(Self::conflict(&namespace, &name));
        }

        let release = finalizers.is_empty() && stored.meta().deletion_timestamp.is_some();
        let meta = stored.meta_mut();
        meta.finalizers = Some(finalizers);
        meta.resource_version = Some(self.next_version());
        let updated = stored.clone();
        if release {
            objects.remove(&k);
        }
        Ok(updated)
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        Ok(self
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|wanted| wanted == ns))
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}

#[derive(Debug, Clone)]
struct StoredSecret {
    data: SecretData,
    owner: Option<OwnerReference>,
}

/// In-memory [`SecretStore`]
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    secrets: Mutex<BTreeMap<Key, StoredSecret>>,
}

impl MemorySecretStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a secret
    pub fn insert(&self, namespace: &str, name: &str, entries: &[(&str, &[u8])]) {
        let data = entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.to_vec()))
            .collect();
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key(namespace, name), StoredSecret { data, owner: None });
    }

    /// Current data of a secret
    #[must_use]
    pub fn data(&self, namespace: &str, name: &str) -> Option<SecretData> {
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(namespace, name))
            .map(|s| s.data.clone())
    }

    /// Owner recorded when the secret was applied
    #[must_use]
    pub fn owner(&self, namespace: &str, name: &str) -> Option<OwnerReference> {
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(namespace, name))
            .and_then(|s| s.owner.clone())
    }
}

#[async_trait]
impl SecretStore for MemorySecretStore {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SecretData>, StoreError> {
        Ok(self.data(namespace, name))
    }

    async fn secret_ownership(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<SecretOwnership, StoreError> {
        Ok(self
            .secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key(namespace, name))
            .map_or(SecretOwnership::Absent, |s| {
                SecretOwnership::from_owner_references(s.owner.as_slice())
            }))
    }

    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
        owner: Option<OwnerReference>,
    ) -> Result<(), StoreError> {
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key(namespace, name), StoredSecret { data, owner });
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.secrets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key(namespace, name));
        Ok(())
    }
}
