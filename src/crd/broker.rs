//! # ClusterServiceBroker
//!
//! Registration of an Open Service Broker endpoint.

use crate::crd::ObjectReference;
use serde::{Deserialize, Serialize};

/// ClusterServiceBroker Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: servicecatalog.k8s.io/v1beta1
/// kind: ClusterServiceBroker
/// metadata:
///   name: ups-broker
/// spec:
///   url: http://ups-broker.brokers.svc.cluster.local
///   authSecretRef:
///     namespace: brokers
///     name: ups-broker-auth
///   relistInterval: 15m
/// ```
#[derive(kube::CustomResource, Debug, Clone, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "ClusterServiceBroker",
    group = "servicecatalog.k8s.io",
    version = "v1beta1",
    shortname = "csb",
    printcolumn = r#"{"name":"URL", "type":"string", "jsonPath":".spec.url"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterServiceBrokerSpec {
    /// Base URL of the broker
    pub url: String,
    /// Secret with `username` and `password` keys for HTTP basic auth
    #[serde(default)]
    pub auth_secret_ref: Option<ObjectReference>,
    /// How long a fetched catalog stays valid (e.g. "15m"); defaults to the controller setting
    #[serde(default)]
    pub relist_interval: Option<String>,
}
