//! Core traits and types for the eventide persistence layer.
//!
//! This crate provides the backend-agnostic half of eventide:
//!
//! - [`event`] - Event envelopes, headers, link events and the payload codec
//!   trait (`EventPayload`)
//! - [`version`] - 1-based stream version arithmetic shared by every adapter
//! - [`concurrency`] - The `WrongExpectedVersion` conflict error
//! - [`store`] - The `EventStore` contract and an in-memory reference backend
//! - [`schema`] - Entity schema descriptors replacing runtime reflection
//! - [`rows`] - Row stores and the unit of work used by relational projections
//! - [`projection`] - Projection commands, projectors and the consumer glue
//! - [`queue`] - The batched, single-flight projection job queue
//! - [`scheduler`] - Periodic callback abstraction over the host runtime
//! - [`keyvalue`] - The partitioned, change-tracked key-value projection
//!   provider
//!
//! # Example
//!
//! ```
//! use eventide_core::store::inmemory;
//!
//! # #[derive(Clone, Debug)] struct Noop;
//! # impl eventide_core::event::EventPayload for Noop {
//! #     const EVENT_KINDS: &'static [&'static str] = &["noop"];
//! #     fn kind(&self) -> &'static str { "noop" }
//! #     fn encode(&self) -> Result<serde_json::Value, serde_json::Error> {
//! #         Ok(serde_json::Value::Null)
//! #     }
//! #     fn decode(
//! #         _: &str,
//! #         _: serde_json::Value,
//! #     ) -> Result<Self, eventide_core::event::EventDecodeError> {
//! #         Ok(Noop)
//! #     }
//! # }
//! let store: inmemory::Store<Noop> = inmemory::Store::new();
//! ```
//!
//! Most users should depend on the `eventide` crate, which re-exports these
//! types alongside the backend crates.

pub mod concurrency;
pub mod event;
pub mod keyvalue;
pub mod projection;
pub mod queue;
pub mod rows;
pub mod scheduler;
pub mod schema;
pub mod store;
pub mod version;
