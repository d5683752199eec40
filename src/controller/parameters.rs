//! # Parameter Resolution
//!
//! Merges inline parameters with parameter documents stored in secrets.
//!
//! Secret documents are merged in reference order with shallow top-level
//! overwrite; the inline document is merged last so its keys always win. The
//! status snapshot only ever sees a redacted copy plus a checksum of the full
//! result, so secret values never land on the resource.

use crate::constants::REDACTED_PARAMETER_VALUE;
use crate::crd::ParametersFromSource;
use crate::store::{SecretData, SecretStore, StoreError};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("secret {namespace}/{name} referenced in parametersFrom not found")]
    MissingSecret { namespace: String, name: String },
    #[error("key '{key}' not found in secret {namespace}/{name}")]
    MissingKey {
        namespace: String,
        name: String,
        key: String,
    },
    #[error("value of key '{key}' in secret {name} is not a JSON object: {reason}")]
    MalformedSecretValue {
        name: String,
        key: String,
        reason: String,
    },
    #[error("inline parameters must be a JSON object")]
    MalformedInlineParameters,
    #[error("parametersFrom entry {index} has no source")]
    EmptySource { index: usize },
    #[error("failed to read parameters secret: {0}")]
    Store(#[from] StoreError),
}

/// Merged parameters ready to send, plus what may be recorded in status
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResolvedParameters {
    /// Full merged document, or `None` when empty
    pub parameters: Option<Map<String, Value>>,
    /// Copy with secret-sourced top-level values replaced
    pub redacted: Option<Value>,
    /// SHA-256 of the canonical JSON of `parameters`
    pub checksum: Option<String>,
}

/// Resolve the parameters of a resource in `namespace`
pub async fn resolve_parameters(
    namespace: &str,
    inline: Option<&Value>,
    parameters_from: &[ParametersFromSource],
    secrets: &dyn SecretStore,
) -> Result<ResolvedParameters, ResolveError> {
    let mut merged = Map::new();
    let mut secret_keys = BTreeSet::new();

    for (index, source) in parameters_from.iter().enumerate() {
        let key_ref = source
            .secret_key_ref
            .as_ref()
            .ok_or(ResolveError::EmptySource { index })?;
        let data = secrets
            .get_secret(namespace, &key_ref.name)
            .await?
            .ok_or_else(|| ResolveError::MissingSecret {
                namespace: namespace.to_string(),
                name: key_ref.name.clone(),
            })?;
        let document = parse_secret_document(&data, &key_ref.name, &key_ref.key, namespace)?;
        for (k, v) in document {
            secret_keys.insert(k.clone());
            merged.insert(k, v);
        }
    }

    let mut inline_keys = BTreeSet::new();
    match inline {
        None | Some(Value::Null) => {}
        Some(Value::Object(inline)) => {
            for (k, v) in inline {
                inline_keys.insert(k.clone());
                merged.insert(k.clone(), v.clone());
            }
        }
        Some(_) => return Err(ResolveError::MalformedInlineParameters),
    }

    if merged.is_empty() {
        return Ok(ResolvedParameters::default());
    }

    let redacted = merged
        .iter()
        .map(|(k, v)| {
            if secret_keys.contains(k) && !inline_keys.contains(k) {
                (k.clone(), Value::String(REDACTED_PARAMETER_VALUE.to_string()))
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect::<Map<_, _>>();

    let checksum = checksum(&Value::Object(merged.clone()));
    Ok(ResolvedParameters {
        parameters: Some(merged),
        redacted: Some(Value::Object(redacted)),
        checksum: Some(checksum),
    })
}

fn parse_secret_document(
    data: &SecretData,
    name: &str,
    key: &str,
    namespace: &str,
) -> Result<Map<String, Value>, ResolveError> {
    let bytes = data.get(key).ok_or_else(|| ResolveError::MissingKey {
        namespace: namespace.to_string(),
        name: name.to_string(),
        key: key.to_string(),
    })?;
    let malformed = |reason: String| ResolveError::MalformedSecretValue {
        name: name.to_string(),
        key: key.to_string(),
        reason,
    };
    match serde_json::from_slice::<Value>(bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(malformed(format!("found {}", json_kind(&other)))),
        Err(e) => Err(malformed(e.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// SHA-256 over the key-sorted JSON encoding of `value`
#[must_use]
pub fn checksum(value: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(value).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let body = entries
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), canonical_json(v)))
                .collect::<Vec<_>>()
                .join(",");
            format!("{{{body}}}")
        }
        Value::Array(items) => {
            let body = items
                .iter()
                .map(canonical_json)
                .collect::<Vec<_>>()
                .join(",");
            format!("[{body}]")
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::SecretKeyReference;
    use crate::store::memory::MemorySecretStore;
    use serde_json::json;

    fn from_secret(name: &str, key: &str) -> ParametersFromSource {
        ParametersFromSource {
            secret_key_ref: Some(SecretKeyReference {
                name: name.to_string(),
                key: key.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn test_inline_wins_over_secret() {
        let secrets = MemorySecretStore::new();
        secrets.insert("ns", "p", &[("params", br#"{"a": 1, "b": 2}"#.as_slice())]);

        let resolved = resolve_parameters(
            "ns",
            Some(&json!({"a": "inline"})),
            &[from_secret("p", "params")],
            &secrets,
        )
        .await
        .unwrap();

        let params = resolved.parameters.unwrap();
        assert_eq!(params["a"], json!("inline"));
        assert_eq!(params["b"], json!(2));
        assert_eq!(
            resolved.redacted.unwrap(),
            json!({"a": "inline", "b": "<redacted>"})
        );
    }

    #[tokio::test]
    async fn test_later_secret_overwrites_earlier() {
        let secrets = MemorySecretStore::new();
        secrets.insert("ns", "one", &[("k", br#"{"x": 1, "y": 1}"#.as_slice())]);
        secrets.insert("ns", "two", &[("k", br#"{"x": 2}"#.as_slice())]);

        let resolved = resolve_parameters(
            "ns",
            None,
            &[from_secret("one", "k"), from_secret("two", "k")],
            &secrets,
        )
        .await
        .unwrap();

        assert_eq!(
            Value::Object(resolved.parameters.unwrap()),
            json!({"x": 2, "y": 1})
        );
    }

    #[tokio::test]
    async fn test_empty_secret_document_means_no_parameters() {
        let secrets = MemorySecretStore::new();
        secrets.insert("ns", "p", &[("params", b"{}".as_slice())]);

        let resolved = resolve_parameters("ns", None, &[from_secret("p", "params")], &secrets)
            .await
            .unwrap();
        assert_eq!(resolved, ResolvedParameters::default());
    }

    #[tokio::test]
    async fn test_resolution_errors() {
        let secrets = MemorySecretStore::new();
        secrets.insert("ns", "bad", &[("params", b"not json".as_slice())]);
        secrets.insert("ns", "list", &[("params", b"[1,2]".as_slice())]);

        let missing = resolve_parameters("ns", None, &[from_secret("nope", "k")], &secrets).await;
        assert!(matches!(missing, Err(ResolveError::MissingSecret { .. })));

        let no_key = resolve_parameters("ns", None, &[from_secret("bad", "other")], &secrets).await;
        assert!(matches!(no_key, Err(ResolveError::MissingKey { .. })));

        let bad = resolve_parameters("ns", None, &[from_secret("bad", "params")], &secrets).await;
        assert!(matches!(bad, Err(ResolveError::MalformedSecretValue { .. })));

        let list = resolve_parameters("ns", None, &[from_secret("list", "params")], &secrets).await;
        assert!(matches!(list, Err(ResolveError::MalformedSecretValue { .. })));
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let a = json!({"b": {"y": 1, "x": [1, 2]}, "a": "s"});
        let b = json!({"a": "s", "b": {"x": [1, 2], "y": 1}});
        assert_eq!(checksum(&a), checksum(&b));
        assert_ne!(checksum(&a), checksum(&json!({"a": "t"})));
        assert_eq!(checksum(&a).len(), 64);
    }
}
