//! Append-only event log adapter.
//!
//! This crate implements the eventide [`EventStore`] contract on top of an
//! EventStoreDB-style event log:
//!
//! - [`EventLog`] - The native primitives of such a log (0-based revisions,
//!   native expected revisions, paged forward reads with link resolution)
//! - [`LogStore`] - The contract adapter over any [`EventLog`]
//! - [`memory::MemoryLog`] - An in-process log with the same semantics,
//!   including `$>` link events and stream deletion
//! - `esdb::EsdbLog` - The EventStoreDB gRPC client, behind the
//!   `eventstoredb` feature
//!
//! [`EventStore`]: eventide_core::store::EventStore

mod error;
mod log;
mod store;
pub mod wire;

pub mod memory;

#[cfg(feature = "eventstoredb")]
pub mod esdb;

pub use error::Error;
pub use log::{
    AppendOutcome, EventLog, ExpectedRevision, LogRecord, ReadOutcome, RecordedEvent,
    ResolvedRecord,
};
pub use store::{LogStore, PAGE_SIZE};
