//! # Secret Transforms
//!
//! Transforms applied to broker credentials before they are written to the
//! binding's secret.

use crate::crd::ObjectReference;
use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// A single credential transform
///
/// Serialized externally tagged, matching the Kubernetes list form:
///
/// ```yaml
/// secretTransforms:
///   - addKey: {key: url, jsonPathExpression: "{.host}"}
///   - renameKey: {from: pwd, to: password}
///   - removeKey: {key: internal}
///   - addKeysFrom: {secretRef: {name: extra}}
/// ```
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SecretTransform {
    AddKey(AddKeyTransform),
    RenameKey(RenameKeyTransform),
    RemoveKey(RemoveKeyTransform),
    AddKeysFrom(AddKeysFromTransform),
}

/// Add a key whose value is literal bytes, a string or a JSONPath result
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AddKeyTransform {
    pub key: String,
    /// Base64-encoded bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    /// Evaluated against the credentials produced so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_path_expression: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RenameKeyTransform {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct RemoveKeyTransform {
    pub key: String,
}

/// Copy every key of another secret into the credentials
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AddKeysFromTransform {
    pub secret_ref: ObjectReference,
}

impl JsonSchema for SecretTransform {
    fn schema_name() -> Cow<'static, str> {
        Cow::Borrowed("SecretTransform")
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        // One object with optional members instead of oneOf, which keeps the
        // schema structural for the API server.
        schemars::json_schema!({
            "type": "object",
            "description": "Credential transform. Exactly one of addKey, renameKey, removeKey, addKeysFrom must be set.",
            "properties": {
                "addKey": {
                    "type": "object",
                    "required": ["key"],
                    "properties": {
                        "key": {"type": "string"},
                        "value": {"type": "string", "format": "byte"},
                        "stringValue": {"type": "string"},
                        "jsonPathExpression": {"type": "string"}
                    }
                },
                "renameKey": {
                    "type": "object",
                    "required": ["from", "to"],
                    "properties": {
                        "from": {"type": "string"},
                        "to": {"type": "string"}
                    }
                },
                "removeKey": {
                    "type": "object",
                    "required": ["key"],
                    "properties": {
                        "key": {"type": "string"}
                    }
                },
                "addKeysFrom": {
                    "type": "object",
                    "required": ["secretRef"],
                    "properties": {
                        "secretRef": {
                            "type": "object",
                            "required": ["name"],
                            "properties": {
                                "namespace": {"type": "string"},
                                "name": {"type": "string"}
                            }
                        }
                    }
                }
            },
            "minProperties": 1,
            "maxProperties": 1
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_list_deserializes_in_order() {
        let transforms: Vec<SecretTransform> = serde_json::from_value(serde_json::json!([
            {"addKey": {"key": "foo", "stringValue": "bar"}},
            {"renameKey": {"from": "foo", "to": "baz"}},
            {"removeKey": {"key": "baz"}},
            {"addKeysFrom": {"secretRef": {"name": "other"}}}
        ]))
        .unwrap();

        assert_eq!(transforms.len(), 4);
        assert!(matches!(&transforms[0], SecretTransform::AddKey(t) if t.key == "foo"));
        assert!(matches!(&transforms[1], SecretTransform::RenameKey(t) if t.to == "baz"));
        assert!(matches!(&transforms[2], SecretTransform::RemoveKey(t) if t.key == "baz"));
        assert!(
            matches!(&transforms[3], SecretTransform::AddKeysFrom(t) if t.secret_ref.namespace.is_none())
        );
    }
}
