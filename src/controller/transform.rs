//! # Credential Transforms
//!
//! Applies the ordered `secretTransforms` of a binding to the credentials
//! returned by the broker, producing the data of the credentials secret.

use crate::controller::jsonpath::{JsonPath, JsonPathError};
use crate::crd::{AddKeyTransform, SecretTransform};
use crate::store::{SecretData, SecretStore, StoreError};
use base64::Engine;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("addKey '{key}' must set exactly one of value, stringValue, jsonPathExpression")]
    AmbiguousAddKey { key: String },
    #[error("addKey '{key}' value is not valid base64: {reason}")]
    InvalidBytes { key: String, reason: String },
    #[error(transparent)]
    JsonPath(#[from] JsonPathError),
    #[error("JSONPath '{expression}' for key '{key}' matched {count} nodes, expected exactly one")]
    JsonPathResultCount {
        key: String,
        expression: String,
        count: usize,
    },
    #[error("secret {namespace}/{name} referenced by addKeysFrom not found")]
    MissingSecret { namespace: String, name: String },
    #[error("secret {namespace}/{name} already exists and is not controlled by this binding")]
    SecretNotOwned { namespace: String, name: String },
    #[error("secret store error: {0}")]
    Store(#[from] StoreError),
}

/// A single credential value
///
/// Broker credentials arrive as JSON; values copied from secrets or given as
/// literal bytes stay bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialValue {
    Json(Value),
    Bytes(Vec<u8>),
}

impl CredentialValue {
    /// Secret encoding: strings as UTF-8, other JSON values as JSON text
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            CredentialValue::Json(Value::String(s)) => s.into_bytes(),
            CredentialValue::Json(other) => other.to_string().into_bytes(),
            CredentialValue::Bytes(bytes) => bytes,
        }
    }

    /// View used for JSONPath evaluation
    fn as_json(&self) -> Value {
        match self {
            CredentialValue::Json(v) => v.clone(),
            CredentialValue::Bytes(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => Value::String(s.to_string()),
                Err(_) => Value::Null,
            },
        }
    }
}

/// Flat key to value map of credentials
pub type Credentials = BTreeMap<String, CredentialValue>;

/// Wrap broker credentials
#[must_use]
pub fn credentials_from_broker(credentials: Map<String, Value>) -> Credentials {
    credentials
        .into_iter()
        .map(|(k, v)| (k, CredentialValue::Json(v)))
        .collect()
}

/// Apply `transforms` in order
///
/// `namespace` is the binding's namespace, used when an `addKeysFrom`
/// reference omits one.
pub async fn apply_transforms(
    mut credentials: Credentials,
    transforms: &[SecretTransform],
    namespace: &str,
    secrets: &dyn SecretStore,
) -> Result<Credentials, TransformError> {
    for transform in transforms {
        match transform {
            SecretTransform::AddKey(add) => {
                let value = add_key_value(add, &credentials)?;
                credentials.insert(add.key.clone(), value);
            }
            SecretTransform::RenameKey(rename) => {
                if let Some(value) = credentials.remove(&rename.from) {
                    credentials.insert(rename.to.clone(), value);
                }
            }
            SecretTransform::RemoveKey(remove) => {
                credentials.remove(&remove.key);
            }
            SecretTransform::AddKeysFrom(from) => {
                let ns = from.secret_ref.namespace.as_deref().unwrap_or(namespace);
                let data = secrets
                    .get_secret(ns, &from.secret_ref.name)
                    .await?
                    .ok_or_else(|| TransformError::MissingSecret {
                        namespace: ns.to_string(),
                        name: from.secret_ref.name.clone(),
                    })?;
                for (k, v) in data {
                    credentials.insert(k, CredentialValue::Bytes(v));
                }
            }
        }
    }
    Ok(credentials)
}

fn add_key_value(
    add: &AddKeyTransform,
    credentials: &Credentials,
) -> Result<CredentialValue, TransformError> {
    match (&add.value, &add.string_value, &add.json_path_expression) {
        (Some(encoded), None, None) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(CredentialValue::Bytes)
            .map_err(|e| TransformError::InvalidBytes {
                key: add.key.clone(),
                reason: e.to_string(),
            }),
        (None, Some(s), None) => Ok(CredentialValue::Json(Value::String(s.clone()))),
        (None, None, Some(expression)) => {
            let path = JsonPath::parse(expression)?;
            let document = Value::Object(
                credentials
                    .iter()
                    .map(|(k, v)| (k.clone(), v.as_json()))
                    .collect(),
            );
            let matches = path.evaluate(&document);
            match matches.as_slice() {
                [single] => Ok(CredentialValue::Json((*single).clone())),
                other => Err(TransformError::JsonPathResultCount {
                    key: add.key.clone(),
                    expression: expression.clone(),
                    count: other.len(),
                }),
            }
        }
        _ => Err(TransformError::AmbiguousAddKey {
            key: add.key.clone(),
        }),
    }
}

/// Encode credentials as secret data
#[must_use]
pub fn to_secret_data(credentials: Credentials) -> SecretData {
    credentials
        .into_iter()
        .map(|(k, v)| (k, v.into_bytes()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AddKeysFromTransform, ObjectReference, RemoveKeyTransform, RenameKeyTransform,
    };
    use crate::store::memory::MemorySecretStore;
    use serde_json::json;

    fn creds(value: Value) -> Credentials {
        match value {
            Value::Object(map) => credentials_from_broker(map),
            _ => unreachable!(),
        }
    }

    fn add_string(key: &str, value: &str) -> SecretTransform {
        SecretTransform::AddKey(AddKeyTransform {
            key: key.to_string(),
            string_value: Some(value.to_string()),
            ..AddKeyTransform::default()
        })
    }

    fn remove(key: &str) -> SecretTransform {
        SecretTransform::RemoveKey(RemoveKeyTransform {
            key: key.to_string(),
        })
    }

    #[tokio::test]
    async fn test_order_matters_for_add_and_remove() {
        let secrets = MemorySecretStore::new();

        let added_then_removed = apply_transforms(
            Credentials::new(),
            &[add_string("k", "v"), remove("k")],
            "ns",
            &secrets,
        )
        .await
        .unwrap();
        assert!(!added_then_removed.contains_key("k"));

        let removed_then_added = apply_transforms(
            Credentials::new(),
            &[remove("k"), add_string("k", "v")],
            "ns",
            &secrets,
        )
        .await
        .unwrap();
        assert_eq!(
            removed_then_added.get("k"),
            Some(&CredentialValue::Json(json!("v")))
        );
    }

    #[tokio::test]
    async fn test_full_pipeline() {
        let secrets = MemorySecretStore::new();
        secrets.insert("ns", "other-secret", &[("qux", b"quux".as_slice())]);

        let transforms = vec![
            add_string("addedStringValue", "stringValue"),
            SecretTransform::AddKey(AddKeyTransform {
                key: "addedByteArray".to_string(),
                value: Some("Ynl0ZUFycmF5".to_string()),
                ..AddKeyTransform::default()
            }),
            SecretTransform::AddKey(AddKeyTransform {
                key: "valueFromJSONPath".to_string(),
                json_path_expression: Some("{.foo}".to_string()),
                ..AddKeyTransform::default()
            }),
            SecretTransform::RenameKey(RenameKeyTransform {
                from: "foo".to_string(),
                to: "bar".to_string(),
            }),
            SecretTransform::AddKeysFrom(AddKeysFromTransform {
                secret_ref: ObjectReference {
                    namespace: None,
                    name: "other-secret".to_string(),
                },
            }),
            remove("baz"),
        ];

        let result = apply_transforms(
            creds(json!({"foo": "123", "baz": "zap"})),
            &transforms,
            "ns",
            &secrets,
        )
        .await
        .unwrap();
        let data = to_secret_data(result);

        let expected: SecretData = [
            ("addedByteArray", "byteArray"),
            ("addedStringValue", "stringValue"),
            ("bar", "123"),
            ("qux", "quux"),
            ("valueFromJSONPath", "123"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
        .collect();
        assert_eq!(data, expected);
    }

    #[tokio::test]
    async fn test_rename_and_remove_missing_are_noops() {
        let secrets = MemorySecretStore::new();
        let input = creds(json!({"a": 1}));
        let result = apply_transforms(
            input.clone(),
            &[
                SecretTransform::RenameKey(RenameKeyTransform {
                    from: "missing".to_string(),
                    to: "b".to_string(),
                }),
                remove("also-missing"),
            ],
            "ns",
            &secrets,
        )
        .await
        .unwrap();
        assert_eq!(result, input);
    }

    #[tokio::test]
    async fn test_json_path_must_match_exactly_one_node() {
        let secrets = MemorySecretStore::new();
        let add = |expr: &str| {
            vec![SecretTransform::AddKey(AddKeyTransform {
                key: "out".to_string(),
                json_path_expression: Some(expr.to_string()),
                ..AddKeyTransform::default()
            })]
        };
        let input = creds(json!({"hosts": ["a", "b"]}));

        let none = apply_transforms(input.clone(), &add("{.missing}"), "ns", &secrets).await;
        assert!(matches!(
            none,
            Err(TransformError::JsonPathResultCount { count: 0, .. })
        ));

        let many = apply_transforms(input, &add("{.hosts[*]}"), "ns", &secrets).await;
        assert!(matches!(
            many,
            Err(TransformError::JsonPathResultCount { count: 2, .. })
        ));
    }

    #[tokio::test]
    async fn test_add_keys_from_missing_secret_fails() {
        let secrets = MemorySecretStore::new();
        let result = apply_transforms(
            Credentials::new(),
            &[SecretTransform::AddKeysFrom(AddKeysFromTransform {
                secret_ref: ObjectReference {
                    namespace: Some("elsewhere".to_string()),
                    name: "gone".to_string(),
                },
            })],
            "ns",
            &secrets,
        )
        .await;
        assert!(
            matches!(result, Err(TransformError::MissingSecret { namespace, .. }) if namespace == "elsewhere")
        );
    }

    #[test]
    fn test_non_string_json_is_encoded_as_json() {
        assert_eq!(CredentialValue::Json(json!(5432)).into_bytes(), b"5432".to_vec());
        assert_eq!(
            CredentialValue::Json(json!({"a": true})).into_bytes(),
            br#"{"a":true}"#.to_vec()
        );
    }
}
