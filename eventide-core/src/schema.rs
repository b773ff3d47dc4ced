//! Entity schema descriptors.
//!
//! Projection targets describe their shape with an explicit
//! [`EntitySchema`]: field names, field kinds, which field is the primary key
//! and the validation constraints checked before every save. Descriptors are
//! built once per entity type and cached in a [`SchemaRegistry`] keyed by
//! [`TypeId`], so primary-key resolution happens once per process.

use std::{
    any::TypeId,
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock},
};

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use uuid::Uuid;

/// A JSON object holding one entity's fields.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// Storage-relevant kind of a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    Uuid,
    /// Anything else: collections, nested structs, timestamps.
    Json,
}

/// Validation constraint attached to a field.
#[derive(Clone, Debug, PartialEq)]
pub enum Constraint {
    /// The field must be present and not null (and not an empty string).
    Required,
    /// Text fields may hold at most this many characters.
    MaxLength(usize),
    /// Integer fields must lie within `min..=max`.
    Range { min: i64, max: i64 },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldSchema {
    pub name: &'static str,
    pub kind: FieldKind,
    pub key: bool,
    pub constraints: Vec<Constraint>,
}

/// Shape of one entity type.
///
/// ```
/// use eventide_core::schema::{Constraint, EntitySchema, FieldKind};
///
/// let schema = EntitySchema::new("ShoppingList")
///     .key("id", FieldKind::Uuid)
///     .field("name", FieldKind::Text, [Constraint::Required, Constraint::MaxLength(64)])
///     .field("items", FieldKind::Json, []);
/// assert_eq!(schema.table(), "shopping_list");
/// ```
#[derive(Clone, Debug, PartialEq)]
pub struct EntitySchema {
    entity_type: &'static str,
    fields: Vec<FieldSchema>,
}

impl EntitySchema {
    #[must_use]
    pub const fn new(entity_type: &'static str) -> Self {
        Self {
            entity_type,
            fields: Vec::new(),
        }
    }

    /// Declare the primary key field.
    #[must_use]
    pub fn key(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldSchema {
            name,
            kind,
            key: true,
            constraints: vec![Constraint::Required],
        });
        self
    }

    #[must_use]
    pub fn field(
        mut self,
        name: &'static str,
        kind: FieldKind,
        constraints: impl IntoIterator<Item = Constraint>,
    ) -> Self {
        self.fields.push(FieldSchema {
            name,
            kind,
            key: false,
            constraints: constraints.into_iter().collect(),
        });
        self
    }

    #[must_use]
    pub const fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldSchema] {
        &self.fields
    }

    #[must_use]
    pub fn field_schema(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Relational table name: the entity type in `snake_case`.
    #[must_use]
    pub fn table(&self) -> String {
        let mut table = String::with_capacity(self.entity_type.len() + 4);
        for (i, c) in self.entity_type.chars().enumerate() {
            if c.is_ascii_uppercase() {
                if i > 0 {
                    table.push('_');
                }
                table.push(c.to_ascii_lowercase());
            } else if c.is_ascii_alphanumeric() {
                table.push(c);
            } else {
                table.push('_');
            }
        }
        table
    }

    /// Check every constraint against `document`.
    ///
    /// # Errors
    ///
    /// Returns all violations found, not just the first.
    pub fn validate(&self, document: &Document) -> Result<(), ValidationErrors> {
        let mut violations = Vec::new();
        for field in &self.fields {
            let value = document.get(field.name).filter(|v| !v.is_null());
            for constraint in &field.constraints {
                if let Some(message) = check(constraint, value) {
                    violations.push(Violation {
                        field: field.name.to_owned(),
                        message,
                    });
                }
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors {
                entity_type: self.entity_type.to_owned(),
                violations,
            })
        }
    }
}

fn check(constraint: &Constraint, value: Option<&serde_json::Value>) -> Option<String> {
    match (constraint, value) {
        (Constraint::Required, None) => Some("is required".to_owned()),
        (Constraint::Required, Some(serde_json::Value::String(s))) if s.is_empty() => {
            Some("is required".to_owned())
        }
        (Constraint::MaxLength(max), Some(serde_json::Value::String(s)))
            if s.chars().count() > *max =>
        {
            Some(format!("must be at most {max} characters"))
        }
        (Constraint::Range { min, max }, Some(value)) => match value.as_i64() {
            Some(n) if n < *min || n > *max => Some(format!("must be between {min} and {max}")),
            Some(_) => None,
            None => Some("must be an integer".to_owned()),
        },
        _ => None,
    }
}

/// One failed constraint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    pub field: String,
    pub message: String,
}

/// An entity failed validation before save. Retrying cannot fix it.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{entity_type} failed validation: {}", format_violations(.violations))]
pub struct ValidationErrors {
    pub entity_type: String,
    pub violations: Vec<Violation>,
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("`{}` {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors in schema descriptors or key values.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("{entity_type} declares no primary key")]
    MissingPrimaryKey { entity_type: String },
    #[error("{entity_type} declares more than one primary key")]
    CompositePrimaryKey { entity_type: String },
    #[error("{entity_type} primary key `{field}` has unsupported kind {kind:?}")]
    UnsupportedKeyKind {
        entity_type: String,
        field: String,
        kind: FieldKind,
    },
    #[error("{entity_type} primary key not found in document (field `{field}`)")]
    KeyNotInDocument { entity_type: String, field: String },
    #[error("`{value}` is not a valid {expected:?} primary key")]
    InvalidKey { value: String, expected: KeyType },
}

/// Column type of a primary key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyType {
    Uuid,
    Integer,
    Text,
}

/// A primary key value.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PrimaryKey {
    Uuid(Uuid),
    Integer(i64),
    Text(String),
}

impl PrimaryKey {
    /// Convert to the key type the entity declares.
    ///
    /// Lets callers look entities up with whatever representation they hold
    /// (a GUID carried as text in an event, say).
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidKey`] when the value cannot be converted.
    pub fn coerce(self, key_type: KeyType) -> Result<Self, SchemaError> {
        let invalid = |value: String| SchemaError::InvalidKey {
            value,
            expected: key_type,
        };
        match (self, key_type) {
            (key @ Self::Uuid(_), KeyType::Uuid)
            | (key @ Self::Integer(_), KeyType::Integer)
            | (key @ Self::Text(_), KeyType::Text) => Ok(key),
            (Self::Text(s), KeyType::Uuid) => {
                Uuid::parse_str(&s).map(Self::Uuid).map_err(|_| invalid(s))
            }
            (Self::Text(s), KeyType::Integer) => {
                s.parse().map(Self::Integer).map_err(|_| invalid(s))
            }
            (key, KeyType::Text) => Ok(Self::Text(key.to_string())),
            (key, _) => Err(invalid(key.to_string())),
        }
    }

    /// Read the key out of a JSON value of the given type.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidKey`] for values of the wrong shape.
    pub fn from_json(value: &serde_json::Value, key_type: KeyType) -> Result<Self, SchemaError> {
        let key = match value {
            serde_json::Value::String(s) => Self::Text(s.clone()),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(n) => Self::Integer(n),
                None => {
                    return Err(SchemaError::InvalidKey {
                        value: n.to_string(),
                        expected: key_type,
                    });
                }
            },
            other => {
                return Err(SchemaError::InvalidKey {
                    value: other.to_string(),
                    expected: key_type,
                });
            }
        };
        key.coerce(key_type)
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Uuid(id) => serde_json::Value::String(id.to_string()),
            Self::Integer(n) => serde_json::Value::from(*n),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uuid(id) => fmt::Display::fmt(id, f),
            Self::Integer(n) => fmt::Display::fmt(n, f),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<Uuid> for PrimaryKey {
    fn from(id: Uuid) -> Self {
        Self::Uuid(id)
    }
}

impl From<i64> for PrimaryKey {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<String> for PrimaryKey {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for PrimaryKey {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

/// A projection target type.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Describe this type. Called once per process by [`SchemaRegistry`].
    fn schema() -> EntitySchema;
}

/// A schema with its primary key resolved.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityDescriptor {
    schema: EntitySchema,
    key_field: &'static str,
    key_type: KeyType,
}

impl EntityDescriptor {
    /// Resolve the primary key of `schema`.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] if the schema has no key, more than one, or
    /// a key of a kind that cannot be a column key.
    pub fn new(schema: EntitySchema) -> Result<Self, SchemaError> {
        let mut keys = schema.fields.iter().filter(|f| f.key);
        let key = keys.next().ok_or_else(|| SchemaError::MissingPrimaryKey {
            entity_type: schema.entity_type.to_owned(),
        })?;
        if keys.next().is_some() {
            return Err(SchemaError::CompositePrimaryKey {
                entity_type: schema.entity_type.to_owned(),
            });
        }
        let key_type = match key.kind {
            FieldKind::Uuid => KeyType::Uuid,
            FieldKind::Integer => KeyType::Integer,
            FieldKind::Text => KeyType::Text,
            kind => {
                return Err(SchemaError::UnsupportedKeyKind {
                    entity_type: schema.entity_type.to_owned(),
                    field: key.name.to_owned(),
                    kind,
                });
            }
        };
        Ok(Self {
            key_field: key.name,
            key_type,
            schema,
        })
    }

    #[must_use]
    pub const fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    #[must_use]
    pub const fn entity_type(&self) -> &'static str {
        self.schema.entity_type
    }

    #[must_use]
    pub const fn key_field(&self) -> &'static str {
        self.key_field
    }

    #[must_use]
    pub const fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// Extract the primary key from a document.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::KeyNotInDocument`] when the key field is absent
    /// or null, [`SchemaError::InvalidKey`] when it has the wrong type.
    pub fn key_of(&self, document: &Document) -> Result<PrimaryKey, SchemaError> {
        let value = document
            .get(self.key_field)
            .filter(|v| !v.is_null())
            .ok_or_else(|| SchemaError::KeyNotInDocument {
                entity_type: self.entity_type().to_owned(),
                field: self.key_field.to_owned(),
            })?;
        PrimaryKey::from_json(value, self.key_type)
    }
}

/// Process-wide cache of entity descriptors, keyed by type identity.
#[derive(Default)]
pub struct SchemaRegistry {
    descriptors: RwLock<HashMap<TypeId, Arc<EntityDescriptor>>>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Descriptor for `T`, built on first use.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] if `T::schema()` is invalid.
    pub fn descriptor<T: Entity>(&self) -> Result<Arc<EntityDescriptor>, SchemaError> {
        let type_id = TypeId::of::<T>();
        if let Some(descriptor) = self
            .descriptors
            .read()
            .expect("schema registry lock poisoned")
            .get(&type_id)
        {
            return Ok(Arc::clone(descriptor));
        }

        let descriptor = Arc::new(EntityDescriptor::new(T::schema())?);
        tracing::debug!(
            entity_type = descriptor.entity_type(),
            key_field = descriptor.key_field(),
            key_type = ?descriptor.key_type(),
            "registered entity schema"
        );
        let mut descriptors = self
            .descriptors
            .write()
            .expect("schema registry lock poisoned");
        Ok(Arc::clone(descriptors.entry(type_id).or_insert(descriptor)))
    }

    /// Primary key type of `T`.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] if `T::schema()` is invalid.
    pub fn key_type<T: Entity>(&self) -> Result<KeyType, SchemaError> {
        Ok(self.descriptor::<T>()?.key_type())
    }

    /// Number of registered entity types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.descriptors
            .read()
            .expect("schema registry lock poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serialize an entity to its document form.
///
/// # Errors
///
/// Returns the serializer's error, or a custom error when the entity does not
/// serialize to a JSON object.
pub fn to_document<T: Serialize>(entity: &T) -> Result<Document, serde_json::Error> {
    match serde_json::to_value(entity)? {
        serde_json::Value::Object(document) => Ok(document),
        other => Err(<serde_json::Error as serde::ser::Error>::custom(format!(
            "entity serialized to {other}, expected an object"
        ))),
    }
}
