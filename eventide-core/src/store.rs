//! Event store contract.
//!
//! This module describes the storage contract (`EventStore`) every backend
//! adapter implements, the errors it reports, and a reference in-memory
//! implementation.
//!
//! Versions in this API are 1-based: the first event of a stream is version
//! 1, and version 0 means "no stream". See [`crate::version`] for the
//! translation helpers adapters use to reach their native numbering.
use std::future::Future;

pub use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    concurrency::WrongExpectedVersion,
    event::{Envelope, Event, EventPayload},
};

pub mod inmemory;

/// Error from [`EventStore::append`].
#[derive(Debug, Error)]
pub enum AppendError<StoreError>
where
    StoreError: std::error::Error,
{
    /// The stream was not at the expected version. Never retried internally.
    #[error(transparent)]
    Conflict(#[from] WrongExpectedVersion),
    /// An event in the batch could not be encoded.
    #[error("failed to encode event {index} of the batch: {reason}")]
    Encode { index: usize, reason: String },
    /// Underlying store error.
    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

impl<StoreError: std::error::Error> AppendError<StoreError> {
    /// Create a store error variant.
    pub const fn store(err: StoreError) -> Self {
        Self::Store(err)
    }

    /// Whether this is a concurrency conflict.
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Result of [`EventStore::read_last_event`].
#[derive(Clone, Debug, PartialEq)]
pub struct LastEvent<E> {
    /// The most recent event, `None` for an empty or missing stream.
    pub event: Option<Envelope<E>>,
    /// 1-based version of `event`, 0 for an empty or missing stream.
    pub version: u64,
}

impl<E> LastEvent<E> {
    /// The "absent" sentinel for an empty or missing stream.
    #[must_use]
    pub const fn absent() -> Self {
        Self {
            event: None,
            version: crate::version::NO_STREAM,
        }
    }

    #[must_use]
    pub const fn is_absent(&self) -> bool {
        self.event.is_none() && self.version == crate::version::NO_STREAM
    }
}

/// Convenience alias for stream reads.
pub type ReadResult<E, Err> = Result<Vec<Envelope<E>>, Err>;

/// Abstraction over the persistence layer for event streams.
///
/// Implemented identically in spirit by every backend adapter:
///
/// - appends are all-or-nothing and guarded by `expected_version`;
/// - reads return resolved [`Envelope`]s in stream order, following link
///   events transparently;
/// - missing streams read as empty, never as errors;
/// - nothing here retries. Conflicts and backend failures are reported to
///   the caller as they happen.
pub trait EventStore: Send + Sync {
    /// Payload sum type this store reads and writes.
    type Event: EventPayload;

    /// Store-specific error type.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append `events` to `stream` if it is currently at `expected_version`.
    ///
    /// Returns the number of events appended (not the new version).
    ///
    /// # Errors
    ///
    /// Returns [`AppendError::Conflict`] if the stream is at any other
    /// version; the stream is left unchanged.
    fn append<'a>(
        &'a self,
        stream: &'a str,
        expected_version: u64,
        events: NonEmpty<Event<Self::Event>>,
    ) -> impl Future<Output = Result<u64, AppendError<Self::Error>>> + Send + 'a;

    /// Read a whole stream from its first event.
    fn read_stream<'a>(
        &'a self,
        stream: &'a str,
    ) -> impl Future<Output = ReadResult<Self::Event, Self::Error>> + Send + 'a {
        self.read_stream_from_event(stream, 1)
    }

    /// Read a stream from `from_version` (inclusive) to its end.
    ///
    /// `from_version` values before the first event are clamped to the start.
    fn read_stream_from_event<'a>(
        &'a self,
        stream: &'a str,
        from_version: u64,
    ) -> impl Future<Output = ReadResult<Self::Event, Self::Error>> + Send + 'a;

    /// Read the most recent event of a stream and its version.
    fn read_last_event<'a>(
        &'a self,
        stream: &'a str,
    ) -> impl Future<Output = Result<LastEvent<Self::Event>, Self::Error>> + Send + 'a;

    /// Read the single event at `version`, `None` when it does not exist.
    fn read_stream_event<'a>(
        &'a self,
        stream: &'a str,
        version: u64,
    ) -> impl Future<Output = Result<Option<Envelope<Self::Event>>, Self::Error>> + Send + 'a;

    /// Delete every stream. For test harnesses only.
    fn clear(&self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;

    /// Current version of a stream, 0 when it does not exist.
    fn current_version<'a>(
        &'a self,
        stream: &'a str,
    ) -> impl Future<Output = Result<u64, Self::Error>> + Send + 'a {
        async move { Ok(self.read_last_event(stream).await?.version) }
    }
}

/// Encode every domain event of a batch, reporting the index of the first
/// failure.
///
/// Link events are passed through as `None` so adapters can apply their own
/// link encoding.
///
/// # Errors
///
/// Returns [`AppendError::Encode`] with the failing index.
pub fn encode_batch<E, StoreError>(
    events: &NonEmpty<Event<E>>,
) -> Result<Vec<Option<serde_json::Value>>, AppendError<StoreError>>
where
    E: EventPayload,
    StoreError: std::error::Error,
{
    let mut encoded = Vec::with_capacity(events.len());
    for (index, event) in events.iter().enumerate() {
        match event {
            Event::Domain(envelope) => {
                let data = envelope
                    .payload
                    .encode()
                    .map_err(|error| AppendError::Encode {
                        index,
                        reason: error.to_string(),
                    })?;
                encoded.push(Some(data));
            }
            Event::Link(link) => {
                if link.event_version == crate::version::NO_STREAM {
                    return Err(AppendError::Encode {
                        index,
                        reason: format!(
                            "link to `{}` points at version 0, which never holds an event",
                            link.stream_name
                        ),
                    });
                }
                encoded.push(None);
            }
        }
    }
    Ok(encoded)
}
