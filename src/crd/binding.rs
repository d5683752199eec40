//! # ServiceBinding
//!
//! A request for credentials to a ServiceInstance, injected into a secret.

use crate::crd::{LocalObjectReference, ParametersFromSource, SecretTransform, UserInfo};
use serde::{Deserialize, Serialize};

/// ServiceBinding Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: servicecatalog.k8s.io/v1beta1
/// kind: ServiceBinding
/// metadata:
///   name: my-database-creds
///   namespace: default
/// spec:
///   instanceRef:
///     name: my-database
///   secretName: db-creds
///   secretTransforms:
///     - renameKey: {from: pwd, to: password}
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServiceBinding",
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::ServiceBindingStatus",
    shortname = "sb",
    printcolumn = r#"{"name":"Instance", "type":"string", "jsonPath":".spec.instanceRef.name"}, {"name":"Secret", "type":"string", "jsonPath":".spec.secretName"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}, {"name":"Reason", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBindingSpec {
    /// Instance in the same namespace to bind to
    pub instance_ref: LocalObjectReference,
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::free_form_object_schema")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default)]
    pub parameters_from: Vec<ParametersFromSource>,
    /// Secret receiving the credentials; defaults to the binding name
    #[serde(default)]
    pub secret_name: Option<String>,
    /// Transforms applied in order to the broker credentials
    #[serde(default)]
    pub secret_transforms: Vec<SecretTransform>,
    /// Broker-side binding id; defaults to the object uid
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub user_info: Option<UserInfo>,
}

impl ServiceBinding {
    /// Broker-side id of this binding
    #[must_use]
    pub fn external_id(&self) -> Option<String> {
        self.spec
            .external_id
            .clone()
            .or_else(|| self.metadata.uid.clone())
    }

    /// Name of the secret the credentials are written to
    #[must_use]
    pub fn secret_name(&self) -> Option<String> {
        self.spec
            .secret_name
            .clone()
            .or_else(|| self.metadata.name.clone())
    }
}
