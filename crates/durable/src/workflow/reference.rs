//! `@` reference resolution across the execution scratchpad
//!
//! References are purely path navigation: `@head(.segment)*` where each
//! segment is an identifier or an integer. No expressions, no function
//! calls. Only strings that match the whole grammar are substituted; an `@`
//! embedded in a larger string is a literal.

use serde_json::Value;

/// Errors from reference resolution
///
/// Resolution errors are values, not panics, and they are fatal for the
/// containing step (definition errors, never retried).
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ReferenceError {
    /// The head does not name a step output or reserved entry
    #[error("unknown reference head in '{0}'")]
    UnknownHead(String),

    /// A key segment is absent from the object being traversed
    #[error("missing key '{key}' while resolving '{reference}'")]
    MissingKey { reference: String, key: String },

    /// An index segment is outside the array bounds
    #[error("index {index} out of range while resolving '{reference}'")]
    IndexOutOfRange { reference: String, index: usize },

    /// A segment was applied to a value that cannot be traversed
    #[error("cannot traverse into {found} while resolving '{reference}'")]
    NotTraversable {
        reference: String,
        found: &'static str,
    },
}

/// One path segment of a reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object key
    Key(String),

    /// Array index
    Index(usize),
}

/// A parsed `@head(.segment)*` reference
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    /// The scratchpad entry the path starts from
    pub head: String,

    /// Path below the head, possibly empty
    pub segments: Vec<Segment>,

    raw: String,
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Reference {
    /// Parse a reference string; `None` when the string is not a reference
    ///
    /// The grammar is strict and must match the whole string. Anything else
    /// (including strings with `@` in the middle) is treated as a literal by
    /// the caller.
    pub fn parse(raw: &str) -> Option<Self> {
        let body = raw.strip_prefix('@')?;
        let mut parts = body.split('.');

        let head = parts.next()?;
        if !is_identifier(head) {
            return None;
        }

        let mut segments = Vec::new();
        for part in parts {
            if part.bytes().all(|b| b.is_ascii_digit()) && !part.is_empty() {
                segments.push(Segment::Index(part.parse().ok()?));
            } else if is_identifier(part) {
                segments.push(Segment::Key(part.to_string()));
            } else {
                return None;
            }
        }

        Some(Self {
            head: head.to_string(),
            segments,
            raw: raw.to_string(),
        })
    }

    /// The original reference text
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The per-execution map of step name to step output
///
/// Reserved entries: `input` (the execution input), and within a forEach
/// iteration `item` and `index`. Reconstructed from persisted step results
/// on every (re-)entry, so replay sees exactly the state a non-crashing run
/// would have.
#[derive(Debug, Clone, Default)]
pub struct Scratchpad {
    values: serde_json::Map<String, Value>,
}

impl Scratchpad {
    /// Create a scratchpad seeded with the execution input
    pub fn new(input: Value) -> Self {
        let mut values = serde_json::Map::new();
        values.insert("input".to_string(), input);
        Self { values }
    }

    /// Record a step output under its step name
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Read an entry
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Clone this scratchpad with `item` / `index` bound for one iteration
    pub fn with_iteration(&self, item: Value, index: usize) -> Self {
        let mut values = self.values.clone();
        values.insert("item".to_string(), item);
        values.insert("index".to_string(), Value::from(index));
        Self { values }
    }

    /// Resolve a single parsed reference to its value
    pub fn resolve_reference(&self, reference: &Reference) -> Result<Value, ReferenceError> {
        let mut current = self
            .values
            .get(&reference.head)
            .ok_or_else(|| ReferenceError::UnknownHead(reference.raw.clone()))?;

        for segment in &reference.segments {
            current = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => {
                    map.get(key).ok_or_else(|| ReferenceError::MissingKey {
                        reference: reference.raw.clone(),
                        key: key.clone(),
                    })?
                }
                (Segment::Index(index), Value::Array(items)) => {
                    items
                        .get(*index)
                        .ok_or_else(|| ReferenceError::IndexOutOfRange {
                            reference: reference.raw.clone(),
                            index: *index,
                        })?
                }
                // numeric keys also address objects ("@a.0" on {"0": …})
                (Segment::Index(index), Value::Object(map)) => map
                    .get(&index.to_string())
                    .ok_or_else(|| ReferenceError::MissingKey {
                        reference: reference.raw.clone(),
                        key: index.to_string(),
                    })?,
                (_, other) => {
                    return Err(ReferenceError::NotTraversable {
                        reference: reference.raw.clone(),
                        found: type_name(other),
                    })
                }
            };
        }

        Ok(current.clone())
    }

    /// Deep-substitute references in an input template
    ///
    /// Maps and arrays are walked; a string that is exactly a reference is
    /// replaced by the resolved value with its type preserved.
    pub fn resolve(&self, template: &Value) -> Result<Value, ReferenceError> {
        match template {
            Value::String(s) => match Reference::parse(s) {
                Some(reference) => self.resolve_reference(&reference),
                None => Ok(template.clone()),
            },
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.resolve(v)?)))
                .collect::<Result<serde_json::Map<_, _>, ReferenceError>>()
                .map(Value::Object),
            other => Ok(other.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pad() -> Scratchpad {
        let mut pad = Scratchpad::new(json!({"q": "rust", "items": [1, 2, 3]}));
        pad.insert("fetch", json!({"results": [{"title": "a"}, {"title": "b"}]}));
        pad
    }

    #[test]
    fn test_parse_grammar() {
        let r = Reference::parse("@fetch.results.0.title").unwrap();
        assert_eq!(r.head, "fetch");
        assert_eq!(
            r.segments,
            vec![
                Segment::Key("results".to_string()),
                Segment::Index(0),
                Segment::Key("title".to_string())
            ]
        );

        assert!(Reference::parse("@input").is_some());
        assert!(Reference::parse("no-at").is_none());
        assert!(Reference::parse("@").is_none());
        assert!(Reference::parse("@1abc").is_none());
        assert!(Reference::parse("@a.b c").is_none());
        assert!(Reference::parse("hello @a.b").is_none());
        assert!(Reference::parse("@a..b").is_none());
    }

    #[test]
    fn test_whole_value_substitution_preserves_type() {
        let resolved = pad().resolve(&json!("@input.items")).unwrap();
        assert_eq!(resolved, json!([1, 2, 3]));
    }

    #[test]
    fn test_embedded_reference_is_literal() {
        let resolved = pad().resolve(&json!("see @input.items here")).unwrap();
        assert_eq!(resolved, json!("see @input.items here"));
    }

    #[test]
    fn test_deep_substitution() {
        let template = json!({
            "query": "@input.q",
            "first": "@fetch.results.0",
            "nested": {"all": ["@fetch.results.1.title", 42]}
        });

        let resolved = pad().resolve(&template).unwrap();
        assert_eq!(
            resolved,
            json!({
                "query": "rust",
                "first": {"title": "a"},
                "nested": {"all": ["b", 42]}
            })
        );
    }

    #[test]
    fn test_unknown_head() {
        let err = pad().resolve(&json!("@missing.field")).unwrap_err();
        assert_eq!(err, ReferenceError::UnknownHead("@missing.field".to_string()));
    }

    #[test]
    fn test_index_out_of_range() {
        let err = pad().resolve(&json!("@input.items.9")).unwrap_err();
        assert!(matches!(err, ReferenceError::IndexOutOfRange { index: 9, .. }));
    }

    #[test]
    fn test_not_traversable() {
        let err = pad().resolve(&json!("@input.q.deeper")).unwrap_err();
        assert!(matches!(
            err,
            ReferenceError::NotTraversable { found: "string", .. }
        ));
    }

    #[test]
    fn test_iteration_bindings() {
        let pad = pad().with_iteration(json!({"n": 7}), 2);
        assert_eq!(pad.resolve(&json!("@item.n")).unwrap(), json!(7));
        assert_eq!(pad.resolve(&json!("@index")).unwrap(), json!(2));
    }
}
