//! Relational projections.
//!
//! A [`Projector`] maps each incoming event to at most one
//! [`ProjectionCommand`] against a single entity type. A
//! [`ProjectionConsumer`] wires a projector to a [`RowStore`] through a
//! [`ProjectionQueue`]: every delivered event becomes a queued job that opens
//! a session, applies the command through a [`UnitOfWork`] and commits.

use std::{error::Error as StdError, marker::PhantomData, sync::Arc};

use thiserror::Error;

use crate::{
    event::{Envelope, EventPayload},
    queue::{Job, JobContext, ProjectionQueue},
    rows::{RowError, RowSession, RowStore, UnitOfWork},
    schema::{
        Document, Entity, EntityDescriptor, PrimaryKey, SchemaError, SchemaRegistry,
        ValidationErrors, to_document,
    },
};

/// Failure of a projection job.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The target row of an update, delete, link or unlink does not exist.
    #[error("{entity_type} `{key}` not found")]
    NotFound {
        entity_type: String,
        key: PrimaryKey,
    },
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// A row could not be converted to or from its entity type.
    #[error("failed to map {entity_type}: {source}")]
    Mapping {
        entity_type: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{entity_type} `{key}` already exists")]
    Duplicate {
        entity_type: String,
        key: PrimaryKey,
    },
    /// Connection loss, timeouts and other failures worth retrying.
    #[error("projection backend error: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync + 'static>),
}

impl ProjectionError {
    pub fn backend(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::Backend(Box::new(error))
    }

    /// Whether retrying the same job could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

impl From<RowError> for ProjectionError {
    fn from(error: RowError) -> Self {
        match error {
            RowError::Duplicate { entity_type, key } => Self::Duplicate {
                entity_type: entity_type.to_owned(),
                key,
            },
            RowError::Missing { entity_type, key } => Self::NotFound {
                entity_type: entity_type.to_owned(),
                key,
            },
            RowError::Backend(source) => Self::Backend(source),
        }
    }
}

/// Entity mutation produced by a [`Projector`].
#[derive(Clone, Debug, PartialEq)]
pub enum ProjectionCommand {
    /// Insert a new row.
    Create(Document),
    /// Overwrite the given fields of an existing row.
    Update { key: PrimaryKey, fields: Document },
    Delete { key: PrimaryKey },
    /// Add `value` to the array field `collection`.
    Link {
        key: PrimaryKey,
        collection: String,
        value: serde_json::Value,
    },
    /// Remove `value` from the array field `collection`.
    Unlink {
        key: PrimaryKey,
        collection: String,
        value: serde_json::Value,
    },
}

impl ProjectionCommand {
    /// A `Create` command for a typed entity.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Mapping`] if `entity` does not serialize
    /// to an object.
    pub fn create<T: Entity>(entity: &T) -> Result<Self, ProjectionError> {
        to_document(entity)
            .map(Self::Create)
            .map_err(|source| ProjectionError::Mapping {
                entity_type: T::schema().entity_type().to_owned(),
                source,
            })
    }

    /// An `Update` command from any serializable set of fields.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Mapping`] if `fields` does not serialize to
    /// an object.
    pub fn update<T: Entity>(
        key: impl Into<PrimaryKey>,
        fields: &impl serde::Serialize,
    ) -> Result<Self, ProjectionError> {
        let fields = to_document(fields).map_err(|source| ProjectionError::Mapping {
            entity_type: T::schema().entity_type().to_owned(),
            source,
        })?;
        Ok(Self::Update {
            key: key.into(),
            fields,
        })
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Create(_) => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Link { .. } => "link",
            Self::Unlink { .. } => "unlink",
        }
    }

    /// Stage this mutation in `uow`.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::NotFound`] when an update, delete, link or
    /// unlink targets a missing row.
    pub async fn apply<S: RowSession>(
        self,
        uow: &mut UnitOfWork<S>,
        descriptor: &Arc<EntityDescriptor>,
    ) -> Result<(), ProjectionError> {
        match self {
            Self::Create(document) => uow.add(descriptor, document).await.map(drop),
            Self::Update { key, fields } => uow.update(descriptor, &key, fields).await,
            Self::Delete { key } => uow.delete(descriptor, &key).await,
            Self::Link {
                key,
                collection,
                value,
            } => uow.add_to_collection(descriptor, &key, &collection, value).await,
            Self::Unlink {
                key,
                collection,
                value,
            } => {
                uow.remove_from_collection(descriptor, &key, &collection, &value)
                    .await
            }
        }
    }
}

/// Maps events to mutations of one entity type.
///
/// ```ignore
/// impl Projector<ListEvent> for ListSummaryProjector {
///     type Entity = ListSummary;
///
///     fn project(
///         &self,
///         event: &Envelope<ListEvent>,
///     ) -> Result<Option<ProjectionCommand>, ProjectionError> {
///         match &event.payload {
///             ListEvent::Created(e) => {
///                 ProjectionCommand::create(&ListSummary::new(e.id, &e.name)).map(Some)
///             }
///             ListEvent::Archived(e) => Ok(Some(ProjectionCommand::Delete { key: e.id.into() })),
///             _ => Ok(None),
///         }
///     }
/// }
/// ```
pub trait Projector<E: EventPayload>: Send + Sync + 'static {
    type Entity: Entity;

    /// The mutation for `event`, `None` when this projection ignores it.
    ///
    /// # Errors
    ///
    /// Returns an error when the event cannot be mapped.
    fn project(&self, event: &Envelope<E>) -> Result<Option<ProjectionCommand>, ProjectionError>;
}

/// Feeds delivered events through a [`Projector`] into a [`ProjectionQueue`].
pub struct ProjectionConsumer<E, P, R> {
    projector: P,
    rows: Arc<R>,
    registry: Arc<SchemaRegistry>,
    queue: ProjectionQueue,
    _event: PhantomData<fn(E)>,
}

impl<E, P, R> ProjectionConsumer<E, P, R>
where
    E: EventPayload,
    P: Projector<E>,
    R: RowStore,
{
    pub fn new(
        projector: P,
        rows: Arc<R>,
        registry: Arc<SchemaRegistry>,
        queue: ProjectionQueue,
    ) -> Self {
        Self {
            projector,
            rows,
            registry,
            queue,
            _event: PhantomData,
        }
    }

    #[must_use]
    pub const fn queue(&self) -> &ProjectionQueue {
        &self.queue
    }

    /// Queue the mutation for `event`, if any, and trigger a flush.
    ///
    /// Returns whether a job was queued.
    ///
    /// # Errors
    ///
    /// Returns mapping and schema errors immediately; nothing is queued.
    pub fn deliver(&self, event: &Envelope<E>) -> Result<bool, ProjectionError> {
        let descriptor = self.registry.descriptor::<P::Entity>()?;
        let context = JobContext {
            entity_type: descriptor.entity_type(),
            event_kind: event.kind(),
            message_id: event.headers.message_id,
            correlation_id: event.headers.correlation_id,
        };
        let command = match self.projector.project(event) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(false),
            Err(error) => {
                tracing::error!(
                    entity_type = context.entity_type,
                    event_kind = context.event_kind,
                    message_id = %context.message_id,
                    correlation_id = %context.correlation_id,
                    %error,
                    "failed to map event to a projection command"
                );
                return Err(error);
            }
        };
        tracing::trace!(
            entity_type = context.entity_type,
            command = command.kind(),
            "queueing projection command"
        );

        let rows = Arc::clone(&self.rows);
        self.queue.enqueue(Job::new(context, move || {
            let rows = Arc::clone(&rows);
            let descriptor = Arc::clone(&descriptor);
            let command = command.clone();
            async move {
                let mut uow = UnitOfWork::new(rows.begin().await?);
                command.apply(&mut uow, &descriptor).await?;
                uow.save_changes().await.map(drop)
            }
        }));
        self.queue.trigger();
        Ok(true)
    }
}
