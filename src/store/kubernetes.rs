//! # Kubernetes Stores
//!
//! [`ResourceStore`] and [`SecretStore`] backed by the Kubernetes API.

use crate::constants::FIELD_MANAGER;
use crate::store::{
    ResourceStore, SecretData, SecretOwnership, SecretStore, StoreError, StoredResource, object_key,
};
use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use std::marker::PhantomData;
use tracing::debug;

/// Map API errors for `kind namespace/name` onto store errors
fn map_api_error(error: kube::Error, kind: &str, namespace: &str, name: &str) -> StoreError {
    match error {
        kube::Error::Api(e) if e.code == 409 => StoreError::Conflict {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(e) if e.code == 404 => StoreError::NotFound {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        other => StoreError::Kube(other),
    }
}

/// Custom resources of kind `K`
#[derive(Clone)]
pub struct KubeResourceStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> std::fmt::Debug for KubeResourceStore<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeResourceStore")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

impl<K: StoredResource> KubeResourceStore<K> {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }

    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K: StoredResource> ResourceStore<K> for KubeResourceStore<K> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        self.api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_api_error(e, &K::kind(&()), namespace, name))
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let (namespace, name) = object_key(obj)?;
        let value = serde_json::to_value(obj)?;
        // resourceVersion in a merge patch makes the API server reject stale writes
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.meta().resource_version },
            "status": value.get("status").cloned().unwrap_or(serde_json::Value::Null),
        });
        debug!("Patching status of {} {}/{}", K::kind(&()), namespace, name);
        self.api(&namespace)
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_api_error(e, &K::kind(&()), &namespace, &name))
    }

    async fn update_finalizers(&self, obj: &K, finalizers: Vec<String>) -> Result<K, StoreError> {
        let (namespace, name) = object_key(obj)?;
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": obj.meta().resource_version,
                "finalizers": finalizers,
            }
        });
        debug!(
            "Setting finalizers of {} {}/{} to {:?}",
            K::kind(&()),
            namespace,
            name,
            finalizers
        );
        self.api(&namespace)
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_api_error(e, &K::kind(&()), &namespace, &name))
    }

    async fn list(&self, namespace: Option<&str>) -> Result<Vec<K>, StoreError> {
        let api: Api<K> = match namespace {
            Some(ns) => self.api(ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }
}

/// Core secrets
#[derive(Clone)]
pub struct KubeSecretStore {
    client: Client,
}

impl std::fmt::Debug for KubeSecretStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeSecretStore").finish_non_exhaustive()
    }
}

impl KubeSecretStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<SecretData>, StoreError> {
        let secret = self
            .api(namespace)
            .get_opt(name)
            .await
            .map_err(|e| map_api_error(e, "Secret", namespace, name))?;
        Ok(secret.map(|s| {
            let mut data: SecretData = s
                .data
                .unwrap_or_default()
                .into_iter()
                .map(|(k, v)| (k, v.0))
                .collect();
            // stringData is write-only on the server but may appear in fixtures
            for (k, v) in s.string_data.unwrap_or_default() {
                data.entry(k).or_insert_with(|| v.into_bytes());
            }
            data
        }))
    }

    async fn secret_ownership(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<SecretOwnership, StoreError> {
        let secret = self
            .api(namespace)
            .get_metadata_opt(name)
            .await
            .map_err(|e| map_api_error(e, "Secret", namespace, name))?;
        Ok(secret.map_or(SecretOwnership::Absent, |s| {
            SecretOwnership::from_owner_references(
                s.metadata.owner_references.as_deref().unwrap_or_default(),
            )
        }))
    }

    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: SecretData,
        owner: Option<OwnerReference>,
    ) -> Result<(), StoreError> {
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                owner_references: owner.map(|o| vec![o]),
                ..ObjectMeta::default()
            },
            data: Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect()),
            type_: Some("Opaque".to_string()),
            ..Secret::default()
        };
        let mut value = serde_json::to_value(&secret)?;
        value["apiVersion"] = serde_json::Value::String("v1".to_string());
        value["kind"] = serde_json::Value::String("Secret".to_string());

        self.api(namespace)
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&value),
            )
            .await
            .map_err(|e| map_api_error(e, "Secret", namespace, name))?;
        debug!("Applied secret {}/{}", namespace, name);
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self.api(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => {
                debug!("Deleted secret {}/{}", namespace, name);
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(map_api_error(e, "Secret", namespace, name)),
        }
    }
}
