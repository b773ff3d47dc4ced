//! Postgres-backed eventide implementations.
//!
//! This crate provides `PostgreSQL` implementations of the core eventide
//! traits:
//!
//! - [`Store`] - An implementation of [`eventide_core::store::EventStore`]
//! - [`rows::PgRowStore`] - An implementation of
//!   [`eventide_core::rows::RowStore`] for relational projections
//!
//! Both can share a connection pool: build the event store with
//! [`Store::connect`] and hand [`Store::pool`] to the row store.

mod error;
pub mod rows;
mod settings;
mod store;

pub use error::Error;
pub use settings::{Settings, SettingsError};
pub use store::{LINK_KIND, READ_BATCH, Store};
