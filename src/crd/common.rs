//! # Shared CRD Types
//!
//! Types shared by ServiceInstance and ServiceBinding specs.

use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Schema for free-form JSON parameter documents
///
/// Parameters are passed to the broker untouched, so the API server must not
/// prune unknown fields.
pub fn free_form_object_schema(_gen: &mut SchemaGenerator) -> Schema {
    schemars::json_schema!({
        "type": "object",
        "x-kubernetes-preserve-unknown-fields": true,
        "nullable": true
    })
}

/// Source of parameter values stored in a secret
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ParametersFromSource {
    /// Key of a secret in the resource's namespace whose value is a JSON object
    #[serde(default)]
    pub secret_key_ref: Option<SecretKeyReference>,
}

/// Reference to a single key of a secret in the same namespace
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyReference {
    /// Name of the secret
    pub name: String,
    /// Key within the secret
    pub key: String,
}

/// Reference to an object by name and optional namespace
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    /// Namespace of the referent; defaults to the referring object's namespace
    #[serde(default)]
    pub namespace: Option<String>,
    /// Name of the referent
    pub name: String,
}

/// Reference to an object in the same namespace
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    pub name: String,
}

/// Identity of the user that last changed the resource
///
/// Recorded by the API layer. Sent to brokers as the originating identity.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub username: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_info_omits_empty_collections() {
        let info = UserInfo {
            username: "alice".to_string(),
            uid: "123".to_string(),
            ..UserInfo::default()
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json, serde_json::json!({"username": "alice", "uid": "123"}));
    }

    #[test]
    fn test_parameters_from_deserializes_camel_case() {
        let source: ParametersFromSource = serde_json::from_value(serde_json::json!({
            "secretKeyRef": {"name": "creds", "key": "params"}
        }))
        .unwrap();
        assert_eq!(
            source.secret_key_ref,
            Some(SecretKeyReference {
                name: "creds".to_string(),
                key: "params".to_string()
            })
        );
    }
}
