//! # JSONPath
//!
//! The subset of Kubernetes JSONPath template syntax used by `addKey`
//! transforms: `{.a}`, `{.a.b}`, `{.a[0]}`, `{['a.b']}`, `{$.a}`, wildcards
//! `{.a[*]}` / `{.*}`, with the surrounding braces optional.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JsonPathError {
    #[error("invalid JSONPath expression '{expression}': {reason}")]
    Parse { expression: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Field(String),
    Index(i64),
    Wildcard,
}

/// A parsed JSONPath expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parse an expression such as `{.credentials.uri}`
    pub fn parse(expression: &str) -> Result<Self, JsonPathError> {
        let error = |reason: &str| JsonPathError::Parse {
            expression: expression.to_string(),
            reason: reason.to_string(),
        };

        let mut body = expression.trim();
        if let Some(stripped) = body.strip_prefix('{') {
            body = stripped
                .strip_suffix('}')
                .ok_or_else(|| error("unbalanced braces"))?
                .trim();
        }
        if let Some(stripped) = body.strip_prefix('$') {
            body = stripped;
        }
        if body.is_empty() {
            return Err(error("empty expression"));
        }

        let chars: Vec<char> = body.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '.' => {
                    i += 1;
                    let start = i;
                    while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                        i += 1;
                    }
                    let name: String = chars[start..i].iter().collect();
                    match name.as_str() {
                        "" if i >= chars.len() && segments.is_empty() => {}
                        "" => return Err(error("empty field name")),
                        "*" => segments.push(Segment::Wildcard),
                        _ => segments.push(Segment::Field(name)),
                    }
                }
                '[' => {
                    let close = chars[i..]
                        .iter()
                        .position(|c| *c == ']')
                        .map(|p| p + i)
                        .ok_or_else(|| error("unterminated '['"))?;
                    let inner: String = chars[i + 1..close].iter().collect();
                    segments.push(parse_bracket(inner.trim()).ok_or_else(|| error("bad subscript"))?);
                    i = close + 1;
                }
                _ if i == 0 => {
                    // Bare leading field without a dot, e.g. `{foo}`
                    let start = i;
                    while i < chars.len() && chars[i] != '.' && chars[i] != '[' {
                        i += 1;
                    }
                    segments.push(Segment::Field(chars[start..i].iter().collect()));
                }
                _ => return Err(error("unexpected character")),
            }
        }

        Ok(Self { segments })
    }

    /// Every node matched by this path in `root`
    #[must_use]
    pub fn evaluate<'a>(&self, root: &'a Value) -> Vec<&'a Value> {
        let mut nodes = vec![root];
        for segment in &self.segments {
            nodes = nodes
                .into_iter()
                .flat_map(|node| step(node, segment))
                .collect();
        }
        nodes
    }
}

fn parse_bracket(inner: &str) -> Option<Segment> {
    if inner == "*" {
        return Some(Segment::Wildcard);
    }
    for quote in ['\'', '"'] {
        if let Some(name) = inner
            .strip_prefix(quote)
            .and_then(|rest| rest.strip_suffix(quote))
        {
            return Some(Segment::Field(name.to_string()));
        }
    }
    inner.parse().ok().map(Segment::Index)
}

fn step<'a>(node: &'a Value, segment: &Segment) -> Vec<&'a Value> {
    match (segment, node) {
        (Segment::Field(name), Value::Object(map)) => map.get(name).into_iter().collect(),
        (Segment::Index(index), Value::Array(items)) => {
            let resolved = if *index < 0 {
                i64::try_from(items.len()).ok().map(|len| len + index)
            } else {
                Some(*index)
            };
            resolved
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| items.get(i))
                .into_iter()
                .collect()
        }
        (Segment::Wildcard, Value::Array(items)) => items.iter().collect(),
        (Segment::Wildcard, Value::Object(map)) => map.values().collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expr: &str, doc: &Value) -> Vec<Value> {
        JsonPath::parse(expr)
            .unwrap()
            .evaluate(doc)
            .into_iter()
            .cloned()
            .collect()
    }

    #[test]
    fn test_field_access_forms() {
        let doc = json!({"foo": "bar", "a": {"b": 1}, "dotted.key": true});
        assert_eq!(eval("{.foo}", &doc), vec![json!("bar")]);
        assert_eq!(eval(".foo", &doc), vec![json!("bar")]);
        assert_eq!(eval("{$.a.b}", &doc), vec![json!(1)]);
        assert_eq!(eval("{['dotted.key']}", &doc), vec![json!(true)]);
        assert_eq!(eval("{.a['b']}", &doc), vec![json!(1)]);
    }

    #[test]
    fn test_index_and_wildcard() {
        let doc = json!({"hosts": ["h1", "h2"]});
        assert_eq!(eval("{.hosts[0]}", &doc), vec![json!("h1")]);
        assert_eq!(eval("{.hosts[-1]}", &doc), vec![json!("h2")]);
        assert_eq!(eval("{.hosts[*]}", &doc).len(), 2);
        assert!(eval("{.hosts[5]}", &doc).is_empty());
    }

    #[test]
    fn test_missing_path_matches_nothing() {
        let doc = json!({"foo": "bar"});
        assert!(eval("{.nope}", &doc).is_empty());
        assert!(eval("{.foo.bar}", &doc).is_empty());
    }

    #[test]
    fn test_parse_errors() {
        assert!(JsonPath::parse("{.foo").is_err());
        assert!(JsonPath::parse("{}").is_err());
        assert!(JsonPath::parse("{.a[}").is_err());
        assert!(JsonPath::parse("{.a..b}").is_err());
    }
}
