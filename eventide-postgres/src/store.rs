mod append;
mod bootstrap;
mod read;

use std::marker::PhantomData;

use eventide_core::{
    event::{DecodeFailures, Envelope, Event, EventPayload},
    store::{AppendError, EventStore, LastEvent, NonEmpty, ReadResult},
};
use sqlx::PgPool;

use crate::{Error, Settings};

/// Event type of link rows.
pub const LINK_KIND: &str = "$>";

/// Number of rows fetched per query by stream reads.
pub const READ_BATCH: i64 = 256;

/// A PostgreSQL-backed [`EventStore`].
///
/// - One `evt_streams` row per stream holds its current 1-based version and is
///   locked with `FOR UPDATE` by appends.
/// - `evt_events` holds domain events (`data`/`headers` as `jsonb`) and link
///   rows (`kind = '$>'`, `link_stream`/`link_version`), unique on
///   `(stream_name, version)`.
pub struct Store<E> {
    pub(crate) pool: PgPool,
    decode_failures: DecodeFailures,
    _event: PhantomData<fn() -> E>,
}

impl<E> Clone for Store<E> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            decode_failures: self.decode_failures.clone(),
            _event: PhantomData,
        }
    }
}

impl<E> Store<E> {
    /// Construct a store from an existing pool. The schema must already
    /// exist, see [`Store::migrate`].
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            decode_failures: DecodeFailures::new(),
            _event: PhantomData,
        }
    }

    /// Create the working database if needed, open the pool and apply the
    /// schema.
    ///
    /// Safe to run from several processes at once.
    #[tracing::instrument(skip(settings), fields(database = %settings.database))]
    pub async fn connect(settings: &Settings) -> Result<Self, Error> {
        bootstrap::ensure_database(settings).await?;
        let pool = settings
            .pool_options()
            .connect_with(settings.working_options()?)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        tracing::debug!("event store ready");
        Ok(store)
    }

    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Number of stored events skipped on read because they failed to decode.
    #[must_use]
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.count()
    }

    /// Apply the schema (idempotent).
    ///
    /// This uses `CREATE TABLE IF NOT EXISTS` style DDL so it can be run on
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns a `sqlx::Error` if any of the schema creation queries fail.
    #[tracing::instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        bootstrap::migrate(&self.pool).await
    }
}

impl<E: EventPayload> EventStore for Store<E> {
    type Error = Error;
    type Event = E;

    #[tracing::instrument(
        skip(self, events),
        fields(stream, expected_version, events_len = events.len())
    )]
    async fn append<'a>(
        &'a self,
        stream: &'a str,
        expected_version: u64,
        events: NonEmpty<Event<Self::Event>>,
    ) -> Result<u64, AppendError<Self::Error>> {
        self.append_events(stream, expected_version, &events).await
    }

    #[tracing::instrument(skip(self))]
    async fn read_stream_from_event<'a>(
        &'a self,
        stream: &'a str,
        from_version: u64,
    ) -> ReadResult<Self::Event, Self::Error> {
        self.read_from(stream, from_version).await
    }

    async fn read_last_event<'a>(
        &'a self,
        stream: &'a str,
    ) -> Result<LastEvent<Self::Event>, Self::Error> {
        self.read_last(stream).await
    }

    async fn read_stream_event<'a>(
        &'a self,
        stream: &'a str,
        version: u64,
    ) -> Result<Option<Envelope<Self::Event>>, Self::Error> {
        self.read_at(stream, version, 0).await
    }

    #[tracing::instrument(skip(self))]
    async fn clear(&self) -> Result<(), Self::Error> {
        sqlx::query("TRUNCATE evt_events, evt_streams RESTART IDENTITY")
            .execute(&self.pool)
            .await?;
        tracing::debug!("cleared event tables");
        Ok(())
    }
}
