//! Event-sourcing persistence and projection materialization.
//!
//! `eventide` bundles the core contract with its backends:
//!
//! - [`store`] - The [`EventStore`](store::EventStore) contract with 1-based
//!   stream versions, plus the in-memory, log and `PostgreSQL` adapters
//! - [`queue`] and [`projection`] - Batched, retrying projection jobs that
//!   materialize events into relational rows
//! - [`keyvalue`] - Partitioned, change-tracked entity projections in a
//!   key-value store (in-memory or Redis)
//!
//! Backends are selected with cargo features: `postgres` and `redis` are on
//! by default, `eventstoredb` adds the EventStoreDB log client.
//!
//! ```
//! use eventide::store::{EventStore, inmemory};
//! # #[derive(Clone, Debug)] struct Noop;
//! # impl eventide::event::EventPayload for Noop {
//! #     const EVENT_KINDS: &'static [&'static str] = &["noop"];
//! #     fn kind(&self) -> &'static str { "noop" }
//! #     fn encode(&self) -> Result<serde_json::Value, serde_json::Error> {
//! #         Ok(serde_json::Value::Null)
//! #     }
//! #     fn decode(
//! #         _: &str,
//! #         _: serde_json::Value,
//! #     ) -> Result<Self, eventide::event::EventDecodeError> {
//! #         Ok(Noop)
//! #     }
//! # }
//! # async fn run() {
//! let store: inmemory::Store<Noop> = inmemory::Store::new();
//! assert_eq!(store.current_version("Missing-1").await.unwrap(), 0);
//! # }
//! ```

#[cfg(feature = "test-util")]
pub use eventide_core::test;
pub use eventide_core::{
    concurrency, concurrency::WrongExpectedVersion, event,
    event::{Envelope, Event, EventDecodeError, EventPayload, Headers, LinkEvent},
    projection,
    projection::{ProjectionCommand, ProjectionConsumer, ProjectionError, Projector},
    queue,
    queue::{ProjectionQueue, QueueSettings},
    rows, scheduler, schema,
    schema::{Entity, EntitySchema, SchemaRegistry},
    version,
};

pub mod store {
    pub use eventide_core::store::{
        AppendError, EventStore, LastEvent, NonEmpty, ReadResult, inmemory,
    };

    /// Adapter over append-only event logs.
    pub mod log {
        #[cfg(feature = "eventstoredb")]
        #[cfg_attr(docsrs, doc(cfg(feature = "eventstoredb")))]
        pub use eventide_log::esdb;
        pub use eventide_log::{Error, EventLog, LogStore, PAGE_SIZE, memory};
    }

    #[cfg(feature = "postgres")]
    #[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
    pub mod postgres {
        pub use eventide_postgres::{Error, Settings, Store, rows::PgRowStore};
    }
}

pub mod keyvalue {
    pub use eventide_core::keyvalue::{
        ChangeHashEntry, ChangeId, ChangeIdSource, Error, KeyValueProvider, KeyValueStore,
        KvCommand, TYPE_FIELD, codec, inmemory, keys,
    };

    #[cfg(feature = "redis")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
    pub mod redis {
        pub use eventide_redis::{Error, RedisStore, Settings};
    }
}
