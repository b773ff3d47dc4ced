//! Partitioned, change-tracked key-value projections.
//!
//! [`KeyValueProvider`] materializes entities as hashes in a key-value store
//! and indexes them per partition. Every mutation runs as one atomic
//! transaction that also appends a [`ChangeId`] to the partition's change
//! feed, so a reader that sees a change token is guaranteed to see the
//! mutation it stands for.
//!
//! The key layout is a persisted format:
//!
//! | Key | Type | Holds |
//! |---|---|---|
//! | `{EntityType}:{EntityId}` | hash | the entity's fields and [`TYPE_FIELD`] |
//! | `{EntityType}:KeyIndex:{PartitionId}` | set | entity keys in the partition |
//! | `ChangeIndex:{PartitionId}` | list | change tokens, oldest first |
//! | `ChangeHash:{PartitionId}` | hash | change token to entity key |

use std::{
    fmt,
    future::Future,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use uuid::Uuid;

use crate::schema::{Entity, EntityDescriptor, SchemaError, SchemaRegistry, to_document};

pub mod codec;
pub mod inmemory;

/// Number of change tokens fetched per step of a backward change-feed scan.
pub const CHANGE_SCAN_BATCH: usize = 100;

/// Key builders for the persisted layout.
pub mod keys {
    use uuid::Uuid;

    #[must_use]
    pub fn entity(entity_type: &str, entity_id: Uuid) -> String {
        format!("{entity_type}:{entity_id}")
    }

    #[must_use]
    pub fn key_index(entity_type: &str, partition_id: Uuid) -> String {
        format!("{entity_type}:KeyIndex:{partition_id}")
    }

    #[must_use]
    pub fn change_index(partition_id: Uuid) -> String {
        format!("ChangeIndex:{partition_id}")
    }

    #[must_use]
    pub fn change_hash(partition_id: Uuid) -> String {
        format!("ChangeHash:{partition_id}")
    }
}

/// Hash field written with every entity, holding its entity type.
///
/// Keeps the hash of an entity whose fields are all defaults from being
/// empty, which the store would treat as absent.
pub const TYPE_FIELD: &str = "$type";

/// Opaque, ordered change token.
///
/// A token is a 20-digit zero-padded microsecond timestamp followed by the
/// 16 hex digits of the [`ChangeIdSource`] that minted it, so string order is
/// chronological order and writers never mint the same token.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChangeId(String);

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_micros()).unwrap_or(u64::MAX))
}

/// Mints [`ChangeId`]s from a strictly increasing microsecond clock.
///
/// Every source carries a random node id, so two processes writing the same
/// partition in the same microsecond still produce distinct tokens.
#[derive(Debug)]
pub struct ChangeIdSource {
    node: u64,
    last: AtomicU64,
    clock: fn() -> u64,
}

impl Default for ChangeIdSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeIdSource {
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(unix_micros)
    }

    /// A source reading microseconds from `clock`.
    #[must_use]
    pub fn with_clock(clock: fn() -> u64) -> Self {
        Self {
            node: Uuid::new_v4().as_u64_pair().0,
            last: AtomicU64::new(0),
            clock,
        }
    }

    /// The source shared by this process.
    pub fn process() -> Arc<Self> {
        static PROCESS: OnceLock<Arc<ChangeIdSource>> = OnceLock::new();
        Arc::clone(PROCESS.get_or_init(|| Arc::new(Self::new())))
    }

    /// The next token. Strictly greater than every earlier token of this
    /// source, even when the clock stalls or steps back.
    pub fn next(&self) -> ChangeId {
        let now = (self.clock)();
        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(last.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(last, candidate, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return ChangeId(format!("{candidate:020}-{:016x}", self.node)),
                Err(current) => last = current,
            }
        }
    }
}

impl ChangeId {
    /// The next token of this process.
    #[must_use]
    pub fn next() -> Self {
        ChangeIdSource::process().next()
    }

    /// Wrap a token read back from storage.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One entry of a partition's change feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeHashEntry {
    pub change_id: ChangeId,
    /// `{EntityType}:{EntityId}` of the changed entity.
    pub entity_key: String,
}

/// A single key-value store command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvCommand {
    /// `HSET key field value [field value ...]`
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// `DEL key`
    Delete { key: String },
    /// `SADD key member`
    SetAdd { key: String, member: String },
    /// `SREM key member`
    SetRemove { key: String, member: String },
    /// `RPUSH key value`
    ListPush { key: String, value: String },
}

/// Primitives the provider needs from a key-value store.
///
/// Missing keys read as empty, never as errors.
pub trait KeyValueStore: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Run `commands` as one atomic transaction.
    fn exec(&self, commands: Vec<KvCommand>)
    -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Run `commands` as one atomic transaction if `guard` exists when it
    /// runs. Returns whether it ran.
    fn exec_if_exists<'a>(
        &'a self,
        guard: &'a str,
        commands: Vec<KvCommand>,
    ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    fn exists<'a>(&'a self, key: &'a str)
    -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

    /// Every field of a hash.
    fn hash_get_all<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Future<Output = Result<Vec<(String, String)>, Self::Error>> + Send + 'a;

    /// Selected fields of a hash, `None` for absent fields.
    fn hash_get<'a>(
        &'a self,
        key: &'a str,
        fields: &'a [String],
    ) -> impl Future<Output = Result<Vec<Option<String>>, Self::Error>> + Send + 'a;

    fn set_members<'a>(
        &'a self,
        key: &'a str,
    ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + 'a;

    fn list_len<'a>(&'a self, key: &'a str)
    -> impl Future<Output = Result<usize, Self::Error>> + Send + 'a;

    /// Elements `start..=stop` (0-based, inclusive) of a list.
    fn list_range<'a>(
        &'a self,
        key: &'a str,
        start: usize,
        stop: usize,
    ) -> impl Future<Output = Result<Vec<String>, Self::Error>> + Send + 'a;
}

/// Key-value provider error.
#[derive(Debug, Error)]
pub enum Error<StoreError>
where
    StoreError: std::error::Error,
{
    #[error("entity `{key}` does not exist")]
    EntityDoesNotExist { key: String },
    #[error("failed to decode `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: codec::FieldDecodeError,
    },
    #[error("failed to map `{key}`: {source}")]
    Mapping {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("key-value store error: {0}")]
    Store(#[source] StoreError),
}

type KvResult<T, S> = Result<T, Error<<S as KeyValueStore>::Error>>;

/// Materializes entities into a [`KeyValueStore`].
pub struct KeyValueProvider<S> {
    store: S,
    registry: Arc<SchemaRegistry>,
    change_ids: Arc<ChangeIdSource>,
}

impl<S: KeyValueStore> KeyValueProvider<S> {
    pub fn new(store: S) -> Self {
        Self::with_registry(store, Arc::new(SchemaRegistry::new()))
    }

    /// Share a schema registry with other projection components.
    pub fn with_registry(store: S, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            store,
            registry,
            change_ids: ChangeIdSource::process(),
        }
    }

    /// Mint change tokens from `change_ids` instead of the process source.
    #[must_use]
    pub fn with_change_ids(mut self, change_ids: Arc<ChangeIdSource>) -> Self {
        self.change_ids = change_ids;
        self
    }

    pub const fn store(&self) -> &S {
        &self.store
    }

    fn change(&self, partition_id: Uuid, entity_key: &str) -> (ChangeId, [KvCommand; 2]) {
        let change_id = self.change_ids.next();
        let commands = [
            KvCommand::ListPush {
                key: keys::change_index(partition_id),
                value: change_id.0.clone(),
            },
            KvCommand::HashSet {
                key: keys::change_hash(partition_id),
                fields: vec![(change_id.0.clone(), entity_key.to_owned())],
            },
        ];
        (change_id, commands)
    }

    /// Hash fields of `entity`, defaults skipped, [`TYPE_FIELD`] included.
    fn encode<T: Entity>(
        descriptor: &EntityDescriptor,
        entity: &T,
        key: &str,
    ) -> KvResult<Vec<(String, String)>, S> {
        let document = to_document(entity).map_err(|source| Error::Mapping {
            key: key.to_owned(),
            source,
        })?;
        let mut fields = codec::encode(descriptor.schema(), &document);
        fields.retain(|(name, _)| name != TYPE_FIELD);
        fields.push((TYPE_FIELD.to_owned(), descriptor.entity_type().to_owned()));
        Ok(fields)
    }

    /// Run `commands` plus the change entry in one transaction. With a
    /// `guard`, nothing runs unless the guard key exists at commit time.
    async fn commit(
        &self,
        operation: &'static str,
        entity_key: &str,
        partition_id: Uuid,
        mut commands: Vec<KvCommand>,
        guard: Option<&str>,
    ) -> KvResult<ChangeId, S> {
        let (change_id, change) = self.change(partition_id, entity_key);
        commands.extend(change);
        match guard {
            None => self.store.exec(commands).await.map_err(Error::Store)?,
            Some(guard) => {
                let ran = self
                    .store
                    .exec_if_exists(guard, commands)
                    .await
                    .map_err(Error::Store)?;
                if !ran {
                    return Err(Error::EntityDoesNotExist {
                        key: guard.to_owned(),
                    });
                }
            }
        }
        tracing::debug!(
            operation,
            entity_key,
            %partition_id,
            %change_id,
            "key-value transaction committed"
        );
        Ok(change_id)
    }

    /// Write a new entity, index it in the partition and record the change.
    ///
    /// # Errors
    ///
    /// Returns an error if the entity cannot be encoded or the transaction
    /// fails.
    #[tracing::instrument(skip(self, entity))]
    pub async fn create_entity<T: Entity>(
        &self,
        partition_id: Uuid,
        entity_id: Uuid,
        entity: &T,
    ) -> KvResult<ChangeId, S> {
        let descriptor = self.registry.descriptor::<T>()?;
        let key = keys::entity(descriptor.entity_type(), entity_id);
        let fields = Self::encode(&descriptor, entity, &key)?;

        let commands = vec![
            KvCommand::HashSet {
                key: key.clone(),
                fields,
            },
            KvCommand::SetAdd {
                key: keys::key_index(descriptor.entity_type(), partition_id),
                member: key.clone(),
            },
        ];
        self.commit("create", &key, partition_id, commands, None).await
    }

    /// Replace an existing entity's fields and record the change.
    ///
    /// Fields now at their default are removed from the hash.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EntityDoesNotExist`] if the entity does not exist
    /// when the transaction runs; nothing is written then.
    #[tracing::instrument(skip(self, entity))]
    pub async fn update_entity<T: Entity>(
        &self,
        partition_id: Uuid,
        entity_id: Uuid,
        entity: &T,
    ) -> KvResult<ChangeId, S> {
        let descriptor = self.registry.descriptor::<T>()?;
        let key = keys::entity(descriptor.entity_type(), entity_id);
        let fields = Self::encode(&descriptor, entity, &key)?;

        let commands = vec![
            KvCommand::Delete { key: key.clone() },
            KvCommand::HashSet {
                key: key.clone(),
                fields,
            },
            KvCommand::SetAdd {
                key: keys::key_index(descriptor.entity_type(), partition_id),
                member: key.clone(),
            },
        ];
        self.commit("update", &key, partition_id, commands, Some(&key))
            .await
    }

    /// Delete an entity, drop it from the partition and record the change.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    #[tracing::instrument(skip(self))]
    pub async fn delete_entity<T: Entity>(
        &self,
        partition_id: Uuid,
        entity_id: Uuid,
    ) -> KvResult<ChangeId, S> {
        let descriptor = self.registry.descriptor::<T>()?;
        let key = keys::entity(descriptor.entity_type(), entity_id);
        let commands = vec![
            KvCommand::Delete { key: key.clone() },
            KvCommand::SetRemove {
                key: keys::key_index(descriptor.entity_type(), partition_id),
                member: key.clone(),
            },
        ];
        self.commit("delete", &key, partition_id, commands, None).await
    }

    /// Index an existing entity in another partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    #[tracing::instrument(skip(self))]
    pub async fn add_entity_key_to_partition<T: Entity>(
        &self,
        partition_id: Uuid,
        entity_id: Uuid,
    ) -> KvResult<ChangeId, S> {
        let descriptor = self.registry.descriptor::<T>()?;
        let key = keys::entity(descriptor.entity_type(), entity_id);
        let commands = vec![KvCommand::SetAdd {
            key: keys::key_index(descriptor.entity_type(), partition_id),
            member: key.clone(),
        }];
        self.commit("add-key", &key, partition_id, commands, None).await
    }

    /// Record that an entity indexed in the partition changed, keeping it
    /// indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    #[tracing::instrument(skip(self))]
    pub async fn update_entity_key_in_partition<T: Entity>(
        &self,
        partition_id: Uuid,
        entity_id: Uuid,
    ) -> KvResult<ChangeId, S> {
        let descriptor = self.registry.descriptor::<T>()?;
        let key = keys::entity(descriptor.entity_type(), entity_id);
        let commands = vec![KvCommand::SetAdd {
            key: keys::key_index(descriptor.entity_type(), partition_id),
            member: key.clone(),
        }];
        self.commit("update-key", &key, partition_id, commands, None).await
    }

    /// Drop an entity from a partition's index, leaving the entity itself.
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction fails.
    #[tracing::instrument(skip(self))]
    pub async fn remove_entity_key_from_partition<T: Entity>(
        &self,
        partition_id: Uuid,
        entity_id: Uuid,
    ) -> KvResult<ChangeId, S> {
        let descriptor = self.registry.descriptor::<T>()?;
        let key = keys::entity(descriptor.entity_type(), entity_id);
        let commands = vec![KvCommand::SetRemove {
            key: keys::key_index(descriptor.entity_type(), partition_id),
            member: key.clone(),
        }];
        self.commit("remove-key", &key, partition_id, commands, None).await
    }

    /// Read an entity, `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored hash does not decode into `T`.
    pub async fn get_entity<T: Entity>(&self, entity_id: Uuid) -> KvResult<Option<T>, S> {
        let descriptor = self.registry.descriptor::<T>()?;
        let key = keys::entity(descriptor.entity_type(), entity_id);
        if !self.store.exists(&key).await.map_err(Error::Store)? {
            return Ok(None);
        }
        let mut fields = self.store.hash_get_all(&key).await.map_err(Error::Store)?;
        fields.retain(|(name, _)| name != TYPE_FIELD);
        let document =
            codec::decode(descriptor.schema(), fields).map_err(|source| Error::Decode {
                key: key.clone(),
                source,
            })?;
        serde_json::from_value(serde_json::Value::Object(document))
            .map(Some)
            .map_err(|source| Error::Mapping { key, source })
    }

    /// Entity keys indexed in a partition, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn get_partition_keys<T: Entity>(
        &self,
        partition_id: Uuid,
    ) -> KvResult<Vec<String>, S> {
        let descriptor = self.registry.descriptor::<T>()?;
        let mut members = self
            .store
            .set_members(&keys::key_index(descriptor.entity_type(), partition_id))
            .await
            .map_err(Error::Store)?;
        members.sort_unstable();
        Ok(members)
    }

    /// Changes to a partition after `last_change_id`, oldest first.
    ///
    /// With `None`, or a token no longer in the feed, every change is
    /// returned. The feed is scanned backward from its tail in batches of
    /// [`CHANGE_SCAN_BATCH`] until the token is found.
    ///
    /// # Errors
    ///
    /// Returns an error if a store read fails.
    #[tracing::instrument(skip(self))]
    pub async fn get_change_entries(
        &self,
        last_change_id: Option<&ChangeId>,
        partition_id: Uuid,
    ) -> KvResult<Vec<ChangeHashEntry>, S> {
        let index = keys::change_index(partition_id);
        let len = self.store.list_len(&index).await.map_err(Error::Store)?;

        let mut tokens = Vec::new();
        let mut end = len;
        'scan: while end > 0 {
            let start = end.saturating_sub(CHANGE_SCAN_BATCH);
            let batch = self
                .store
                .list_range(&index, start, end - 1)
                .await
                .map_err(Error::Store)?;
            for token in batch.into_iter().rev() {
                if last_change_id.is_some_and(|last| last.as_str() == token) {
                    break 'scan;
                }
                tokens.push(token);
            }
            end = start;
        }
        tokens.reverse();
        tracing::trace!(changes = tokens.len(), "scanned change feed");

        if tokens.is_empty() {
            return Ok(Vec::new());
        }
        let entity_keys = self
            .store
            .hash_get(&keys::change_hash(partition_id), &tokens)
            .await
            .map_err(Error::Store)?;

        let mut entries = Vec::with_capacity(tokens.len());
        for (token, entity_key) in tokens.into_iter().zip(entity_keys) {
            match entity_key {
                Some(entity_key) => entries.push(ChangeHashEntry {
                    change_id: ChangeId(token),
                    entity_key,
                }),
                None => {
                    tracing::warn!(change_id = %token, "change token has no change hash entry");
                }
            }
        }
        Ok(entries)
    }
}
