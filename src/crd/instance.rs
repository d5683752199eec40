//! # ServiceInstance
//!
//! A request for a managed service provisioned by an Open Service Broker.

use crate::crd::{ParametersFromSource, UserInfo};
use serde::{Deserialize, Serialize};

/// ServiceInstance Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: servicecatalog.k8s.io/v1beta1
/// kind: ServiceInstance
/// metadata:
///   name: my-database
///   namespace: default
/// spec:
///   brokerName: ups-broker
///   classExternalName: user-provided-service
///   planExternalName: default
///   parameters:
///     size: small
///   parametersFrom:
///     - secretKeyRef:
///         name: db-params
///         key: params
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ServiceInstance",
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    namespaced,
    status = "crate::crd::ServiceInstanceStatus",
    shortname = "si",
    printcolumn = r#"{"name":"Class", "type":"string", "jsonPath":".spec.classExternalName"}, {"name":"Plan", "type":"string", "jsonPath":".spec.planExternalName"}, {"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}, {"name":"Reason", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstanceSpec {
    /// Name of the ClusterServiceBroker offering the class
    pub broker_name: String,
    /// Catalog name of the service class
    pub class_external_name: String,
    /// Catalog name of the plan
    pub plan_external_name: String,
    /// Inline provisioning parameters; keys here win over `parametersFrom`
    #[serde(default)]
    #[schemars(schema_with = "crate::crd::free_form_object_schema")]
    pub parameters: Option<serde_json::Value>,
    /// Secrets holding additional parameters, merged in order
    #[serde(default)]
    pub parameters_from: Vec<ParametersFromSource>,
    /// Broker-side instance id; defaults to the object uid
    #[serde(default)]
    pub external_id: Option<String>,
    /// User that last changed the spec
    #[serde(default)]
    pub user_info: Option<UserInfo>,
    /// Incrementing this forces an update call with the current plan and parameters
    #[serde(default)]
    pub update_requests: i64,
}

impl ServiceInstance {
    /// Broker-side id of this instance
    #[must_use]
    pub fn external_id(&self) -> Option<String> {
        self.spec
            .external_id
            .clone()
            .or_else(|| self.metadata.uid.clone())
    }
}
