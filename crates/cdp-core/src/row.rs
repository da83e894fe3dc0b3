//! Row model and dotted-path field access.
//!
//! A row is a nested JSON-shaped record. Every row at the pipeline boundary
//! carries at minimum a stable `id` and a `text` payload; processors read and
//! write arbitrary nested fields through [`FieldPath`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CdpError;

/// A nested record: string keys mapping to JSON values.
pub type Row = Map<String, Value>;

/// A pre-compiled dotted field path such as `metadata.language.score`.
///
/// Paths are split once at construction; `get` walks the row and returns
/// `None` whenever a segment is missing or an intermediate value is not an
/// object, `set` creates missing intermediate objects and fails with
/// [`CdpError::PathType`] when an intermediate exists but is not an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct FieldPath {
    raw: String,
    segments: Vec<String>,
}

impl FieldPath {
    pub fn new(path: impl Into<String>) -> Self {
        let raw = path.into();
        let segments = if raw.is_empty() {
            Vec::new()
        } else {
            raw.split('.').map(str::to_owned).collect()
        };
        Self { raw, segments }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Read the value at this path, or `None` if any segment is missing or
    /// an intermediate is not an object. The empty path reads `None`.
    pub fn get<'a>(&self, row: &'a Row) -> Option<&'a Value> {
        let (first, rest) = self.segments.split_first()?;
        let mut current = row.get(first)?;
        for segment in rest {
            current = current.as_object()?.get(segment)?;
        }
        Some(current)
    }

    /// Read the value at this path as a string slice.
    pub fn get_str<'a>(&self, row: &'a Row) -> Option<&'a str> {
        self.get(row).and_then(Value::as_str)
    }

    /// Read the value at this path as a float, accepting any JSON number.
    pub fn get_f64(&self, row: &Row) -> Option<f64> {
        self.get(row).and_then(Value::as_f64)
    }

    /// Write `value` at this path, creating missing intermediate objects.
    pub fn set(&self, row: &mut Row, value: Value) -> Result<(), CdpError> {
        let (last, parents) = self.segments.split_last().ok_or(CdpError::EmptyPath)?;
        let mut current = row;
        for segment in parents {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            current = entry.as_object_mut().ok_or_else(|| CdpError::PathType {
                path: self.raw.clone(),
                segment: segment.clone(),
            })?;
        }
        current.insert(last.clone(), value);
        Ok(())
    }
}

impl From<String> for FieldPath {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.raw
    }
}

impl From<&str> for FieldPath {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl std::fmt::Display for FieldPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Best-effort row identifier for log lines, falling back to `<unknown>`.
pub fn row_id(row: &Row) -> &str {
    row.get("id").and_then(Value::as_str).unwrap_or("<unknown>")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn set_then_get_round_trips() {
        let mut r = Row::new();
        let path = FieldPath::new("metadata.language.score");
        path.set(&mut r, json!(0.95)).unwrap();
        assert_eq!(
            Value::Object(r.clone()),
            json!({"metadata": {"language": {"score": 0.95}}})
        );
        assert_eq!(path.get(&r), Some(&json!(0.95)));
    }

    #[test]
    fn get_missing_returns_none() {
        let r = row(json!({"metadata": {"language": {"score": 0.95}}}));
        assert_eq!(FieldPath::new("metadata.missing.key").get(&r), None);
        assert_eq!(FieldPath::new("absent").get(&r), None);
    }

    #[test]
    fn get_through_non_object_returns_none() {
        let r = row(json!({"text": "hello"}));
        assert_eq!(FieldPath::new("text.nested").get(&r), None);
    }

    #[test]
    fn empty_path_gets_none_and_fails_set() {
        let mut r = Row::new();
        assert_eq!(FieldPath::new("").get(&r), None);
        assert!(matches!(
            FieldPath::new("").set(&mut r, json!(1)),
            Err(CdpError::EmptyPath)
        ));
    }

    #[test]
    fn set_through_non_object_fails() {
        let mut r = row(json!({"text": "hello"}));
        let err = FieldPath::new("text.lang").set(&mut r, json!("en")).unwrap_err();
        assert!(matches!(err, CdpError::PathType { .. }));
        // Row untouched
        assert_eq!(r.get("text"), Some(&json!("hello")));
    }

    #[test]
    fn set_overwrites_leaf() {
        let mut r = row(json!({"a": {"b": 1}}));
        FieldPath::new("a.b").set(&mut r, json!(2)).unwrap();
        assert_eq!(FieldPath::new("a.b").get(&r), Some(&json!(2)));
    }

    #[test]
    fn top_level_path() {
        let mut r = Row::new();
        FieldPath::new("text").set(&mut r, json!("hi")).unwrap();
        assert_eq!(FieldPath::new("text").get_str(&r), Some("hi"));
    }
}
