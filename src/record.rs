//! Event record decoding.
//!
//! Each input line is one JSON object. Decoding never fails loudly: a line
//! that is not a JSON object yields `None` and the caller counts it.

use std::fmt;

use serde_json::{Map, Value};

/// A dotted path into nested JSON objects, e.g. `payload.size`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse a dotted path. Empty segments are ignored.
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('.')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Whether the path has no segments.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

/// A successfully decoded event.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRecord {
    fields: Map<String, Value>,
}

impl DecodedRecord {
    /// Decode one line. Returns `None` for anything but a JSON object.
    pub fn decode(line: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Value>(line) {
            Ok(Value::Object(fields)) => Some(Self { fields }),
            _ => None,
        }
    }

    /// Value at `path`, if every intermediate segment is an object.
    pub fn get(&self, path: &FieldPath) -> Option<&Value> {
        let (first, rest) = path.segments.split_first()?;
        let mut value = self.fields.get(first)?;
        for segment in rest {
            value = value.as_object()?.get(segment)?;
        }
        Some(value)
    }

    /// String value at `path`.
    pub fn get_str(&self, path: &FieldPath) -> Option<&str> {
        self.get(path)?.as_str()
    }

    /// Numeric value at `path`. Strings are not coerced.
    pub fn get_f64(&self, path: &FieldPath) -> Option<f64> {
        self.get(path)?.as_f64().filter(|v| v.is_finite())
    }

    /// Value at `path` rendered as a group key.
    ///
    /// Strings are used verbatim, numbers and booleans are formatted, nested
    /// values are serialized compactly. `null` has no key.
    pub fn get_key(&self, path: &FieldPath) -> Option<String> {
        match self.get(path)? {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Bool(b) => Some(b.to_string()),
            Value::Number(n) => Some(n.to_string()),
            other => Some(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PUSH: &[u8] =
        br#"{"type":"PushEvent","repo":{"name":"octo/cat","id":7},"payload":{"size":3,"ref":null}}"#;

    #[test]
    fn test_field_path_parse() {
        let path = FieldPath::parse("payload.size");
        assert_eq!(path.to_string(), "payload.size");
        assert!(FieldPath::parse("").is_empty());
        assert_eq!(FieldPath::parse(".a..b"), FieldPath::parse("a.b"));
    }

    #[test]
    fn test_decode_and_lookup() {
        let record = DecodedRecord::decode(PUSH).unwrap();
        assert_eq!(record.get_str(&"type".into()), Some("PushEvent"));
        assert_eq!(record.get_f64(&"payload.size".into()), Some(3.0));
        assert_eq!(record.get_key(&"repo.name".into()), Some("octo/cat".to_string()));
        assert_eq!(record.get_key(&"repo.id".into()), Some("7".to_string()));
        assert_eq!(record.get_key(&"payload.ref".into()), None);
        assert!(record.get(&"payload.size.deeper".into()).is_none());
        assert!(record.get(&"missing".into()).is_none());
    }

    #[test]
    fn test_decode_rejects_non_objects() {
        assert!(DecodedRecord::decode(b"").is_none());
        assert!(DecodedRecord::decode(b"{\"type\":").is_none());
        assert!(DecodedRecord::decode(b"[1,2,3]").is_none());
        assert!(DecodedRecord::decode(b"42").is_none());
        assert!(DecodedRecord::decode(&[0xff, 0xfe, b'{', b'}']).is_none());
    }

    #[test]
    fn test_numeric_lookup_does_not_coerce_strings() {
        let record = DecodedRecord::decode(br#"{"payload":{"size":"12"}}"#).unwrap();
        assert_eq!(record.get_f64(&"payload.size".into()), None);

        let record = DecodedRecord::decode(br#"{"payload":{"size":2.5}}"#).unwrap();
        assert_eq!(record.get_f64(&"payload.size".into()), Some(2.5));
    }
}
