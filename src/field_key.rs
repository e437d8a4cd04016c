//! Deterministic string keys for fields, argument-aware.
//!
//! A field key is the store's per-entity field identifier: `fieldName` when the field takes no
//! arguments, else `fieldName(J)` where `J` is the canonical JSON serialization of its arguments
//! with variables substituted. Two selections of the same field with logically equal argument
//! trees — regardless of how those trees were written out, or in what order variables were
//! declared — must produce byte-identical keys (I4). The alias never participates: it only
//! controls where the value lands in a reassembled response tree (see
//! [`crate::document::FieldNode::response_key`]).

use std::fmt;
use std::ops::Deref;

use serde_json_bytes::ByteString;
use serde_json_bytes::Map as JsonMap;
use serde_json_bytes::Value as JsonValue;

use crate::document::FieldNode;
use crate::document::Value;
use crate::document::Variables;
use crate::document::lookup_variable;
use crate::error::CacheError;

/// A store field key: either a bare field name or `name(canonicalArgs)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, derive_more::Display)]
pub struct FieldKey(String);

impl Deref for FieldKey {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl From<FieldKey> for String {
    fn from(key: FieldKey) -> Self {
        key.0
    }
}

impl FieldKey {
    /// Reconstructs a field key from its already-encoded string form, e.g. when decoding a
    /// snapshot (see [`crate::snapshot`]). Does not re-derive or validate it against any field
    /// node; the caller is trusted to be round-tripping a key this module produced.
    pub(crate) fn from_encoded(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

/// Computes the field key for a field node against a variable environment.
pub fn field_key(field: &FieldNode, variables: &Variables) -> Result<FieldKey, CacheError> {
    if field.arguments.is_empty() {
        return Ok(FieldKey(field.name.to_string()));
    }
    let canonical = canonical_arguments(field, variables)?;
    Ok(FieldKey(format!("{}({})", field.name, canonical)))
}

/// The canonical JSON text of a field's arguments: sorted object keys at every level, variables
/// substituted. This is intentionally *not* `serde_json`'s default (insertion-order) output —
/// sorted-key canonicalization means two equivalent argument trees serialize identically
/// regardless of how they were written in the document.
fn canonical_arguments(field: &FieldNode, variables: &Variables) -> Result<String, CacheError> {
    let mut entries = field
        .arguments
        .iter()
        .map(|(name, value)| Ok((name.to_string(), convert(value, variables)?)))
        .collect::<Result<Vec<(String, JsonValue)>, CacheError>>()?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let mut map = JsonMap::new();
    for (k, v) in entries {
        map.insert(ByteString::from(k), v);
    }
    Ok(CanonicalDisplay(&JsonValue::Object(map)).to_string())
}

fn convert(value: &Value, variables: &Variables) -> Result<JsonValue, CacheError> {
    match value {
        Value::Null => Ok(JsonValue::Null),
        Value::Int(i) => Ok(JsonValue::Number((*i).into())),
        Value::Float(f) => Ok(serde_json_bytes::serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null)),
        Value::Boolean(b) => Ok(JsonValue::Bool(*b)),
        Value::String(s) => Ok(JsonValue::String(ByteString::from(s.as_str()))),
        Value::Enum(name) => Ok(JsonValue::String(ByteString::from(name.as_ref()))),
        Value::List(items) => items
            .iter()
            .map(|item| convert(item, variables))
            .collect::<Result<Vec<_>, _>>()
            .map(JsonValue::Array),
        Value::Object(fields) => {
            let mut entries = fields
                .iter()
                .map(|(k, v)| Ok((k.to_string(), convert(v, variables)?)))
                .collect::<Result<Vec<(String, JsonValue)>, CacheError>>()?;
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut map = JsonMap::new();
            for (k, v) in entries {
                map.insert(ByteString::from(k), v);
            }
            Ok(JsonValue::Object(map))
        }
        // Absent variables substitute `null`, matching how GraphQL execution treats a variable
        // with no declared default that the caller didn't supply.
        Value::Variable(name) => Ok(lookup_variable(variables, name)
            .cloned()
            .unwrap_or(JsonValue::Null)),
        Value::Unsupported(kind) => Err(CacheError::UnsupportedArgumentKind {
            kind: (*kind).to_string(),
        }),
    }
}

/// Renders a [`JsonValue`] whose object keys are already sorted, recursively, with no extra
/// whitespace — this is the actual "canonical JSON" text, not just a sorted tree.
struct CanonicalDisplay<'a>(&'a JsonValue);

impl fmt::Display for CanonicalDisplay<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            JsonValue::Null => write!(f, "null"),
            JsonValue::Bool(b) => write!(f, "{b}"),
            JsonValue::Number(n) => write!(f, "{n}"),
            JsonValue::String(s) => write!(f, "{:?}", s.as_str()),
            JsonValue::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", CanonicalDisplay(item))?;
                }
                write!(f, "]")
            }
            JsonValue::Object(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{:?}:{}", k.as_str(), CanonicalDisplay(v))?;
                }
                write!(f, "}}")
            }
        }
    }
}
