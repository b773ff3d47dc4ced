//! Entity hash encoding.
//!
//! Scalar fields are stored as plain strings so the key-value store can be
//! read without a JSON parser: text and UUIDs as-is, numbers and booleans
//! in their decimal or `true` form. Anything else is JSON. Null and default
//! values (`false`, `0`, the nil UUID) are not written at all, and read back
//! as the field's default.

use serde_json::{Number, Value};

use crate::schema::{Document, EntitySchema, FieldKind};

/// A field that could not be decoded from its stored string.
#[derive(Debug, thiserror::Error)]
#[error("field `{field}` holds `{value}`, which is not a valid {kind:?}")]
pub struct FieldDecodeError {
    pub field: String,
    pub value: String,
    pub kind: FieldKind,
}

const NIL_UUID: &str = "00000000-0000-0000-0000-000000000000";

fn is_default(kind: FieldKind, value: &Value) -> bool {
    match value {
        Value::Null | Value::Bool(false) => true,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => kind == FieldKind::Uuid && s == NIL_UUID,
        _ => false,
    }
}

/// Kind of a field, falling back to the shape of its value for fields the
/// schema does not declare.
fn kind_of(schema: &EntitySchema, name: &str, value: &Value) -> FieldKind {
    if let Some(field) = schema.field_schema(name) {
        return field.kind;
    }
    match value {
        Value::String(_) => FieldKind::Text,
        Value::Bool(_) => FieldKind::Boolean,
        Value::Number(n) if n.is_i64() || n.is_u64() => FieldKind::Integer,
        Value::Number(_) => FieldKind::Float,
        _ => FieldKind::Json,
    }
}

/// Encode a document into hash fields, skipping defaults.
#[must_use]
pub fn encode(schema: &EntitySchema, document: &Document) -> Vec<(String, String)> {
    let mut fields = Vec::with_capacity(document.len());
    for (name, value) in document {
        let kind = kind_of(schema, name, value);
        if is_default(kind, value) {
            continue;
        }
        let encoded = match (kind, value) {
            (FieldKind::Text | FieldKind::Uuid, Value::String(s)) => s.clone(),
            (FieldKind::Integer | FieldKind::Float, Value::Number(n)) => n.to_string(),
            (FieldKind::Boolean, Value::Bool(b)) => b.to_string(),
            (_, other) => other.to_string(),
        };
        fields.push((name.clone(), encoded));
    }
    fields
}

/// Decode hash fields back into a document.
///
/// Fields missing from the hash are missing from the document; entity types
/// fill them in with `#[serde(default)]`.
///
/// # Errors
///
/// Returns [`FieldDecodeError`] for a stored value that does not parse as its
/// declared kind.
pub fn decode(
    schema: &EntitySchema,
    fields: impl IntoIterator<Item = (String, String)>,
) -> Result<Document, FieldDecodeError> {
    let mut document = Document::new();
    for (name, raw) in fields {
        let value = match schema.field_schema(&name).map(|f| f.kind) {
            Some(FieldKind::Text | FieldKind::Uuid) => Value::String(raw),
            Some(kind @ FieldKind::Integer) => match raw.parse::<i64>() {
                Ok(n) => Value::from(n),
                Err(_) => return Err(invalid(name, raw, kind)),
            },
            Some(kind @ FieldKind::Float) => {
                match raw.parse::<f64>().ok().and_then(Number::from_f64) {
                    Some(n) => Value::Number(n),
                    None => return Err(invalid(name, raw, kind)),
                }
            }
            Some(kind @ FieldKind::Boolean) => match raw.parse::<bool>() {
                Ok(b) => Value::Bool(b),
                Err(_) => return Err(invalid(name, raw, kind)),
            },
            Some(kind @ FieldKind::Json) => match serde_json::from_str(&raw) {
                Ok(value) => value,
                Err(_) => return Err(invalid(name, raw, kind)),
            },
            // Undeclared: JSON when it parses, text otherwise.
            None => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        };
        document.insert(name, value);
    }
    Ok(document)
}

fn invalid(field: String, value: String, kind: FieldKind) -> FieldDecodeError {
    FieldDecodeError { field, value, kind }
}
