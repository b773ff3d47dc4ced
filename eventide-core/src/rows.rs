//! Row stores and the unit of work used by relational projections.
//!
//! A [`RowStore`] hands out [`RowSession`]s: short-lived, scoped connections
//! that can look rows up and commit a batch of [`RowChange`]s atomically.
//! Projection jobs never talk to a session directly; they go through a
//! [`UnitOfWork`], which tracks added, modified and deleted rows, validates
//! every pending added/modified row against its [`EntitySchema`] and only
//! then commits.
//!
//! [`EntitySchema`]: crate::schema::EntitySchema

use std::{collections::HashMap, error::Error as StdError, future::Future, sync::Arc};

use thiserror::Error;

use crate::{
    projection::ProjectionError,
    schema::{Document, Entity, EntityDescriptor, PrimaryKey, ValidationErrors, to_document},
};

pub mod inmemory;

/// Errors reported by row store backends.
#[derive(Debug, Error)]
pub enum RowError {
    /// An added row collides with an existing primary key.
    #[error("{entity_type} `{key}` already exists")]
    Duplicate {
        entity_type: &'static str,
        key: PrimaryKey,
    },
    /// A modified or deleted row vanished before commit.
    #[error("{entity_type} `{key}` does not exist")]
    Missing {
        entity_type: &'static str,
        key: PrimaryKey,
    },
    /// Connection, timeout or any other backend failure.
    #[error("row store backend error: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync + 'static>),
}

impl RowError {
    pub fn backend(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(error))
    }
}

/// One pending row mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum RowChange {
    Added {
        descriptor: Arc<EntityDescriptor>,
        key: PrimaryKey,
        document: Document,
    },
    Modified {
        descriptor: Arc<EntityDescriptor>,
        key: PrimaryKey,
        document: Document,
    },
    Deleted {
        descriptor: Arc<EntityDescriptor>,
        key: PrimaryKey,
    },
}

impl RowChange {
    #[must_use]
    pub fn descriptor(&self) -> &EntityDescriptor {
        match self {
            Self::Added { descriptor, .. }
            | Self::Modified { descriptor, .. }
            | Self::Deleted { descriptor, .. } => descriptor,
        }
    }

    #[must_use]
    pub const fn key(&self) -> &PrimaryKey {
        match self {
            Self::Added { key, .. } | Self::Modified { key, .. } | Self::Deleted { key, .. } => key,
        }
    }
}

/// Source of scoped sessions against a relational store.
pub trait RowStore: Send + Sync + 'static {
    type Session: RowSession;

    /// Open a session. Each projection job opens its own.
    fn begin(&self) -> impl Future<Output = Result<Self::Session, RowError>> + Send + '_;
}

/// A scoped connection to a relational store.
pub trait RowSession: Send {
    /// Load the row with primary key `key`, `None` if there is none.
    fn find<'a>(
        &'a mut self,
        descriptor: &'a EntityDescriptor,
        key: &'a PrimaryKey,
    ) -> impl Future<Output = Result<Option<Document>, RowError>> + Send + 'a;

    /// Apply every change atomically, in order.
    fn commit(self, changes: Vec<RowChange>) -> impl Future<Output = Result<(), RowError>> + Send;
}

#[derive(Debug)]
enum State {
    Added(Document),
    Modified(Document),
    Deleted,
}

#[derive(Debug)]
struct Pending {
    descriptor: Arc<EntityDescriptor>,
    state: State,
}

type TrackingKey = (&'static str, PrimaryKey);

/// Change tracker over one [`RowSession`].
///
/// Reads see pending changes first: a row added in this unit of work can be
/// found and updated before anything is committed, and a deleted row reads
/// as absent.
#[derive(Debug)]
pub struct UnitOfWork<S> {
    session: S,
    pending: HashMap<TrackingKey, Pending>,
    order: Vec<TrackingKey>,
}

impl<S: RowSession> UnitOfWork<S> {
    pub fn new(session: S) -> Self {
        Self {
            session,
            pending: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Whether any change is pending.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    fn track(&mut self, descriptor: &Arc<EntityDescriptor>, key: PrimaryKey, state: State) {
        let tracking_key = (descriptor.entity_type(), key);
        if !self.pending.contains_key(&tracking_key) {
            self.order.push(tracking_key.clone());
        }
        self.pending.insert(
            tracking_key,
            Pending {
                descriptor: Arc::clone(descriptor),
                state,
            },
        );
    }

    /// Load a row as a document, honouring pending changes.
    ///
    /// # Errors
    ///
    /// Returns a backend error if the lookup fails.
    pub async fn find_document(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        key: &PrimaryKey,
    ) -> Result<Option<Document>, ProjectionError> {
        let key = key.clone().coerce(descriptor.key_type())?;
        if let Some(pending) = self.pending.get(&(descriptor.entity_type(), key.clone())) {
            return Ok(match &pending.state {
                State::Added(document) | State::Modified(document) => Some(document.clone()),
                State::Deleted => None,
            });
        }
        Ok(self.session.find(descriptor, &key).await?)
    }

    /// Load a typed entity.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Mapping`] if the stored row does not
    /// deserialize into `T`.
    pub async fn find<T: Entity>(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        key: &PrimaryKey,
    ) -> Result<Option<T>, ProjectionError> {
        self.find_document(descriptor, key)
            .await?
            .map(|document| {
                serde_json::from_value(serde_json::Value::Object(document)).map_err(|source| {
                    ProjectionError::Mapping {
                        entity_type: descriptor.entity_type().to_owned(),
                        source,
                    }
                })
            })
            .transpose()
    }

    /// Track a new row.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Duplicate`] if a row with the same key is
    /// already pending or stored.
    pub async fn add(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        document: Document,
    ) -> Result<PrimaryKey, ProjectionError> {
        let key = descriptor.key_of(&document)?;
        let replaces_deleted = matches!(
            self.pending.get(&(descriptor.entity_type(), key.clone())),
            Some(Pending {
                state: State::Deleted,
                ..
            })
        );
        if replaces_deleted {
            self.track(descriptor, key.clone(), State::Modified(document));
            return Ok(key);
        }
        if self.find_document(descriptor, &key).await?.is_some() {
            return Err(ProjectionError::Duplicate {
                entity_type: descriptor.entity_type().to_owned(),
                key,
            });
        }
        self.track(descriptor, key.clone(), State::Added(document));
        Ok(key)
    }

    /// Track a new typed entity.
    ///
    /// # Errors
    ///
    /// See [`UnitOfWork::add`].
    pub async fn add_entity<T: Entity>(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        entity: &T,
    ) -> Result<PrimaryKey, ProjectionError> {
        let document = to_document(entity).map_err(|source| ProjectionError::Mapping {
            entity_type: descriptor.entity_type().to_owned(),
            source,
        })?;
        self.add(descriptor, document).await
    }

    /// Overwrite `fields` of an existing row. The primary key cannot change.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotFound`] if there is no such row.
    pub async fn update(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        key: &PrimaryKey,
        fields: Document,
    ) -> Result<(), ProjectionError> {
        let mut document = self.require(descriptor, key).await?;
        for (name, value) in fields {
            if name != descriptor.key_field() {
                document.insert(name, value);
            }
        }
        self.modify(descriptor, key, document)
    }

    /// Mark an existing row for deletion.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotFound`] if there is no such row.
    pub async fn delete(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        key: &PrimaryKey,
    ) -> Result<(), ProjectionError> {
        self.require(descriptor, key).await?;
        let key = key.clone().coerce(descriptor.key_type())?;
        let tracking_key = (descriptor.entity_type(), key.clone());
        match self.pending.get(&tracking_key).map(|p| &p.state) {
            Some(State::Added(_)) => {
                self.pending.remove(&tracking_key);
                self.order.retain(|k| k != &tracking_key);
            }
            _ => self.track(descriptor, key, State::Deleted),
        }
        Ok(())
    }

    /// Append `value` to the array field `collection`, unless already present.
    ///
    /// A missing or null collection starts out empty.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotFound`] if there is no such row, or
    /// [`ProjectionError::Mapping`] if the field is not an array.
    pub async fn add_to_collection(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        key: &PrimaryKey,
        collection: &str,
        value: serde_json::Value,
    ) -> Result<(), ProjectionError> {
        let mut document = self.require(descriptor, key).await?;
        let items = collection_mut(descriptor, &mut document, collection)?;
        if !items.contains(&value) {
            items.push(value);
        }
        self.modify(descriptor, key, document)
    }

    /// Remove every occurrence of `value` from the array field `collection`.
    ///
    /// # Errors
    ///
    /// As for [`UnitOfWork::add_to_collection`].
    pub async fn remove_from_collection(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        key: &PrimaryKey,
        collection: &str,
        value: &serde_json::Value,
    ) -> Result<(), ProjectionError> {
        let mut document = self.require(descriptor, key).await?;
        collection_mut(descriptor, &mut document, collection)?.retain(|item| item != value);
        self.modify(descriptor, key, document)
    }

    async fn require(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        key: &PrimaryKey,
    ) -> Result<Document, ProjectionError> {
        self.find_document(descriptor, key)
            .await?
            .ok_or_else(|| ProjectionError::NotFound {
                entity_type: descriptor.entity_type().to_owned(),
                key: key.clone(),
            })
    }

    fn modify(
        &mut self,
        descriptor: &Arc<EntityDescriptor>,
        key: &PrimaryKey,
        document: Document,
    ) -> Result<(), ProjectionError> {
        let key = key.clone().coerce(descriptor.key_type())?;
        let state = match self.pending.get(&(descriptor.entity_type(), key.clone())) {
            Some(Pending {
                state: State::Added(_),
                ..
            }) => State::Added(document),
            _ => State::Modified(document),
        };
        self.track(descriptor, key, state);
        Ok(())
    }

    fn validate(&self) -> Result<(), ValidationErrors> {
        for tracking_key in &self.order {
            let Some(pending) = self.pending.get(tracking_key) else {
                continue;
            };
            if let State::Added(document) | State::Modified(document) = &pending.state {
                pending.descriptor.schema().validate(document)?;
            }
        }
        Ok(())
    }

    /// Validate every added or modified row, then commit all changes.
    ///
    /// Returns the number of changes committed.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Validation`] without touching the store if
    /// any row fails validation, otherwise the commit error.
    pub async fn save_changes(mut self) -> Result<usize, ProjectionError> {
        self.validate()?;
        let mut changes = Vec::with_capacity(self.pending.len());
        for tracking_key in std::mem::take(&mut self.order) {
            let Some(Pending { descriptor, state }) = self.pending.remove(&tracking_key) else {
                continue;
            };
            let key = tracking_key.1;
            changes.push(match state {
                State::Added(document) => RowChange::Added {
                    descriptor,
                    key,
                    document,
                },
                State::Modified(document) => RowChange::Modified {
                    descriptor,
                    key,
                    document,
                },
                State::Deleted => RowChange::Deleted { descriptor, key },
            });
        }
        let count = changes.len();
        if count > 0 {
            self.session.commit(changes).await?;
        }
        tracing::trace!(changes = count, "unit of work committed");
        Ok(count)
    }
}

fn collection_mut<'d>(
    descriptor: &EntityDescriptor,
    document: &'d mut Document,
    collection: &str,
) -> Result<&'d mut Vec<serde_json::Value>, ProjectionError> {
    let field = document
        .entry(collection.to_owned())
        .or_insert(serde_json::Value::Null);
    if field.is_null() {
        *field = serde_json::Value::Array(Vec::new());
    }
    match field {
        serde_json::Value::Array(items) => Ok(items),
        other => Err(ProjectionError::Mapping {
            entity_type: descriptor.entity_type().to_owned(),
            source: <serde_json::Error as serde::de::Error>::custom(format!(
                "field `{collection}` holds {other}, expected an array"
            )),
        }),
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use uuid::Uuid;

    use super::*;
    use crate::schema::{Constraint, EntitySchema, FieldKind, SchemaRegistry};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct ShoppingList {
        id: Uuid,
        name: String,
        #[serde(default)]
        items: Vec<String>,
    }

    impl Entity for ShoppingList {
        fn schema() -> EntitySchema {
            EntitySchema::new("ShoppingList")
                .key("id", FieldKind::Uuid)
                .field("name", FieldKind::Text, [Constraint::Required])
                .field("items", FieldKind::Json, [])
        }
    }

    fn descriptor() -> Arc<EntityDescriptor> {
        SchemaRegistry::new().descriptor::<ShoppingList>().unwrap()
    }

    fn list(id: Uuid, name: &str) -> ShoppingList {
        ShoppingList {
            id,
            name: name.to_owned(),
            items: Vec::new(),
        }
    }

    #[tokio::test]
    async fn add_then_update_commits_a_single_insert() {
        let store = inmemory::RowStore::new();
        let descriptor = descriptor();
        let id = Uuid::new_v4();

        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        uow.add_entity(&descriptor, &list(id, "food")).await.unwrap();
        uow.update(
            &descriptor,
            &id.into(),
            json!({ "name": "groceries" }).as_object().unwrap().clone(),
        )
        .await
        .unwrap();
        assert_eq!(uow.save_changes().await.unwrap(), 1);

        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        let stored: ShoppingList = uow.find(&descriptor, &id.into()).await.unwrap().unwrap();
        assert_eq!(stored.name, "groceries");
    }

    #[tokio::test]
    async fn add_then_delete_commits_nothing() {
        let store = inmemory::RowStore::new();
        let descriptor = descriptor();
        let id = Uuid::new_v4();

        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        uow.add_entity(&descriptor, &list(id, "food")).await.unwrap();
        uow.delete(&descriptor, &id.into()).await.unwrap();
        assert!(!uow.has_changes());
        assert_eq!(uow.save_changes().await.unwrap(), 0);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn missing_rows_are_not_found() {
        let store = inmemory::RowStore::new();
        let descriptor = descriptor();
        let key = PrimaryKey::from(Uuid::new_v4());

        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        let update = uow.update(&descriptor, &key, Document::new()).await;
        assert!(matches!(update, Err(ProjectionError::NotFound { .. })));
        let delete = uow.delete(&descriptor, &key).await;
        assert!(matches!(delete, Err(ProjectionError::NotFound { .. })));
        let link = uow
            .add_to_collection(&descriptor, &key, "items", json!("milk"))
            .await;
        assert!(matches!(link, Err(ProjectionError::NotFound { .. })));
    }

    #[tokio::test]
    async fn duplicate_adds_are_rejected() {
        let store = inmemory::RowStore::new();
        let descriptor = descriptor();
        let id = Uuid::new_v4();

        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        uow.add_entity(&descriptor, &list(id, "food")).await.unwrap();
        uow.save_changes().await.unwrap();

        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        let again = uow.add_entity(&descriptor, &list(id, "food")).await;
        assert!(matches!(again, Err(ProjectionError::Duplicate { .. })));
    }

    #[tokio::test]
    async fn collections_add_once_and_remove() {
        let store = inmemory::RowStore::new();
        let descriptor = descriptor();
        let id = Uuid::new_v4();
        let key = PrimaryKey::from(id);

        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        uow.add_entity(&descriptor, &list(id, "food")).await.unwrap();
        uow.save_changes().await.unwrap();

        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        uow.add_to_collection(&descriptor, &key, "items", json!("milk"))
            .await
            .unwrap();
        uow.add_to_collection(&descriptor, &key, "items", json!("eggs"))
            .await
            .unwrap();
        uow.add_to_collection(&descriptor, &key, "items", json!("milk"))
            .await
            .unwrap();
        uow.remove_from_collection(&descriptor, &key, "items", &json!("eggs"))
            .await
            .unwrap();
        uow.save_changes().await.unwrap();

        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        let stored: ShoppingList = uow.find(&descriptor, &key).await.unwrap().unwrap();
        assert_eq!(stored.items, ["milk"]);
    }

    #[tokio::test]
    async fn invalid_rows_block_the_whole_commit() {
        let store = inmemory::RowStore::new();
        let descriptor = descriptor();

        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        uow.add_entity(&descriptor, &list(Uuid::new_v4(), "fine"))
            .await
            .unwrap();
        uow.add_entity(&descriptor, &list(Uuid::new_v4(), ""))
            .await
            .unwrap();
        let result = uow.save_changes().await;
        assert!(matches!(result, Err(ProjectionError::Validation(_))));
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn text_keys_are_coerced_to_the_declared_type() {
        let store = inmemory::RowStore::new();
        let descriptor = descriptor();
        let id = Uuid::new_v4();

        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        uow.add_entity(&descriptor, &list(id, "food")).await.unwrap();
        uow.save_changes().await.unwrap();

        let mut uow = UnitOfWork::new(store.begin().await.unwrap());
        let found = uow
            .find_document(&descriptor, &PrimaryKey::from(id.to_string()))
            .await
            .unwrap();
        assert!(found.is_some());
    }
}
