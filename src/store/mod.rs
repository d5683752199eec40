//! # Resource Stores
//!
//! Access to the controller's resources and secrets.
//!
//! - `kubernetes.rs` - Kubernetes API backed stores (production)
//! - `memory.rs` - In-memory stores with the same semantics, used in tests
//!
//! Status and finalizer writes carry the resourceVersion the caller last read;
//! a stale version fails with [`StoreError::Conflict`] and the caller re-reads.

pub mod kubernetes;
pub mod memory;

pub use kubernetes::{KubeResourceStore, KubeSecretStore};
pub use memory::{MemoryResourceStore, MemorySecretStore};

use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use thiserror::Error;

/// Secret contents: key to raw bytes
pub type SecretData = BTreeMap<String, Vec<u8>>;

/// Who controls a secret, from its controller `ownerReference`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretOwnership {
    Absent,
    /// Exists without a controller owner
    Unowned,
    /// Uid of the controlling object
    ControlledBy(String),
}

impl SecretOwnership {
    /// Read the controller uid out of an object's owner references
    #[must_use]
    pub fn from_owner_references(references: &[OwnerReference]) -> Self {
        references
            .iter()
            .find(|r| r.controller == Some(true))
            .map_or(SecretOwnership::Unowned, |r| {
                SecretOwnership::ControlledBy(r.uid.clone())
            })
    }

    #[must_use]
    pub fn is_controlled_by(&self, uid: &str) -> bool {
        matches!(self, SecretOwnership::ControlledBy(owner) if owner == uid)
    }

    /// The object with `uid` may create or overwrite the secret
    #[must_use]
    pub fn writable_by(&self, uid: &str) -> bool {
        matches!(self, SecretOwnership::Absent) || self.is_controlled_by(uid)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conflict writing {kind} {namespace}/{name}: object was modified")]
    Conflict {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: String,
        namespace: String,
        name: String,
    },
    #[error("object is missing metadata.{0}")]
    MissingMetadata(&'static str),
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] ::kube::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Bounds of a namespaced custom resource handled by the stores
pub trait StoredResource:
    ::kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> StoredResource for K where
    K: ::kube::Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Namespace and name of a resource, as required by store calls
pub fn object_key<K: ::kube::Resource>(obj: &K) -> Result<(String, String), StoreError> {
    let meta = obj.meta();
    let namespace = meta
        .namespace
        .clone()
        .ok_or(StoreError::MissingMetadata("namespace"))?;
    let name = meta
        .name
        .clone()
        .ok_or(StoreError::MissingMetadata("name"))?;
    Ok((namespace, name))
}

/// Read and write access to one resource kind
#[async_trait]
pub trait ResourceStore<K: StoredResource>: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;

    /// Replace the status of `obj`, failing with `Conflict` if it changed since read
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;

    /// Replace the finalizer list of `obj`, failing with `Conflict` if it changed since read
    async fn update_finalizers(&self, obj: &K, finalizers: Vec<String>) -> Result<K, StoreError>;

    /// All objects, optionally restricted to one namespace
    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError>;
}

/// Access to secrets: parameter sources, transform sources and credentials
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, namespace: &str, name: &str)
    -> Result<Option<SecretData>, StoreError>;

    async fn secret_ownership(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<SecretOwnership, StoreError>;

    /// Create or replace a secret owned by `owner`
    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
        owner: Option<OwnerReference>,
    ) -> Result<(), StoreError>;

    /// Delete a secret; a missing secret is not an error
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
}
