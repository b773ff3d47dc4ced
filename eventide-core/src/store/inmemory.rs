//! In-memory event store implementation.
//!
//! This module provides [`Store`], a thread-safe in-memory implementation of
//! [`EventStore`](super::EventStore) suitable for unit tests and
//! single-process deployments.
//!
//! Payloads are kept in their encoded JSON form so that reads go through the
//! same decode path as the networked backends.
//!
//! # Example
//!
//! ```ignore
//! use eventide_core::store::inmemory;
//!
//! let store: inmemory::Store<MyEvent> = inmemory::Store::new();
//! ```

use std::{
    collections::HashMap,
    marker::PhantomData,
    sync::{Arc, RwLock},
};

use nonempty::NonEmpty;

use crate::{
    concurrency::WrongExpectedVersion,
    event::{DecodeFailures, Envelope, Event, EventPayload, Headers},
    store::{AppendError, EventStore, LastEvent, ReadResult, encode_batch},
    version,
};

/// Links pointing at links are followed at most this many hops.
const MAX_LINK_DEPTH: usize = 16;

#[derive(Clone, Debug)]
enum Record {
    Domain {
        kind: String,
        data: serde_json::Value,
        headers: Headers,
    },
    Link {
        stream: String,
        version: u64,
    },
}

/// In-memory event store that keeps streams in a hash map.
///
/// The vector index of a record is its 0-based native position; the public
/// version is that index plus one.
pub struct Store<E> {
    streams: Arc<RwLock<HashMap<String, Vec<Record>>>>,
    decode_failures: DecodeFailures,
    _event: PhantomData<fn() -> E>,
}

impl<E> Clone for Store<E> {
    fn clone(&self) -> Self {
        Self {
            streams: Arc::clone(&self.streams),
            decode_failures: self.decode_failures.clone(),
            _event: PhantomData,
        }
    }
}

impl<E> Store<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            decode_failures: DecodeFailures::new(),
            _event: PhantomData,
        }
    }

    /// Number of stored events skipped on read because they failed to decode.
    #[must_use]
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.count()
    }
}

impl<E> Default for Store<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Error type for in-memory store.
///
/// The in-memory backend cannot fail at the storage level; the type exists so
/// the store satisfies [`EventStore::Error`].
#[derive(Debug, thiserror::Error)]
pub enum InMemoryError {
    #[error("link from `{stream}` exceeds the maximum link depth")]
    LinkDepthExceeded { stream: String },
}

impl<E: EventPayload> Store<E> {
    /// Follow links until a domain record is reached.
    fn resolve<'r>(
        streams: &'r HashMap<String, Vec<Record>>,
        stream: &str,
        record: &'r Record,
    ) -> Result<Option<(&'r str, &'r serde_json::Value, &'r Headers)>, InMemoryError> {
        let mut current = record;
        for _ in 0..MAX_LINK_DEPTH {
            match current {
                Record::Domain {
                    kind,
                    data,
                    headers,
                } => return Ok(Some((kind, data, headers))),
                Record::Link { stream, version } => {
                    let target = version::to_zero_based(*version)
                        .and_then(|revision| streams.get(stream)?.get(revision as usize));
                    match target {
                        Some(target) => current = target,
                        None => {
                            tracing::warn!(
                                target_stream = %stream,
                                version,
                                "link points at a missing event; skipping"
                            );
                            return Ok(None);
                        }
                    }
                }
            }
        }
        Err(InMemoryError::LinkDepthExceeded {
            stream: stream.to_owned(),
        })
    }

    fn decode(
        &self,
        streams: &HashMap<String, Vec<Record>>,
        stream: &str,
        position: usize,
        record: &Record,
    ) -> Result<Option<Envelope<E>>, InMemoryError> {
        let Some((kind, data, headers)) = Self::resolve(streams, stream, record)? else {
            return Ok(None);
        };
        match E::decode(kind, data.clone()) {
            Ok(payload) => Ok(Some(Envelope::new(payload, *headers))),
            Err(error) => {
                self.decode_failures.record();
                tracing::error!(
                    stream,
                    version = version::from_zero_based(position as u64),
                    event_kind = kind,
                    message_id = %headers.message_id,
                    correlation_id = %headers.correlation_id,
                    %error,
                    "skipping event that failed to decode"
                );
                Ok(None)
            }
        }
    }
}

impl<E: EventPayload> EventStore for Store<E> {
    type Error = InMemoryError;
    type Event = E;

    #[tracing::instrument(skip(self, events), fields(events_len = events.len()))]
    async fn append<'a>(
        &'a self,
        stream: &'a str,
        expected_version: u64,
        events: NonEmpty<Event<Self::Event>>,
    ) -> Result<u64, AppendError<Self::Error>> {
        let encoded = encode_batch(&events)?;
        let records: Vec<Record> = events
            .into_iter()
            .zip(encoded)
            .map(|(event, data)| match (event, data) {
                (Event::Domain(envelope), Some(data)) => Record::Domain {
                    kind: envelope.payload.kind().to_owned(),
                    data,
                    headers: envelope.headers,
                },
                (Event::Link(link), _) => Record::Link {
                    stream: link.stream_name,
                    version: link.event_version,
                },
                (Event::Domain(_), None) => unreachable!("encode_batch encodes every domain event"),
            })
            .collect();

        let mut streams = self.streams.write().expect("in-memory store lock poisoned");
        let current = streams.get(stream).map_or(0, |s| s.len() as u64);
        if current != expected_version {
            tracing::debug!(current, "version mismatch, rejecting append");
            return Err(WrongExpectedVersion::new(stream, expected_version, Some(current)).into());
        }

        let count = records.len() as u64;
        streams.entry(stream.to_owned()).or_default().extend(records);
        drop(streams);
        tracing::debug!(events_appended = count, "events appended to stream");
        Ok(count)
    }

    #[tracing::instrument(skip(self))]
    async fn read_stream_from_event<'a>(
        &'a self,
        stream: &'a str,
        from_version: u64,
    ) -> ReadResult<Self::Event, Self::Error> {
        let streams = self.streams.read().expect("in-memory store lock poisoned");
        let Some(records) = streams.get(stream) else {
            return Ok(Vec::new());
        };
        let start = version::to_zero_based(version::clamp_from_version(from_version))
            .unwrap_or_default() as usize;

        let mut out = Vec::with_capacity(records.len().saturating_sub(start));
        for (position, record) in records.iter().enumerate().skip(start) {
            if let Some(envelope) = self.decode(&streams, stream, position, record)? {
                out.push(envelope);
            }
        }
        tracing::trace!(events_read = out.len(), "read stream");
        Ok(out)
    }

    async fn read_last_event<'a>(
        &'a self,
        stream: &'a str,
    ) -> Result<LastEvent<Self::Event>, Self::Error> {
        let streams = self.streams.read().expect("in-memory store lock poisoned");
        let Some((position, record)) = streams
            .get(stream)
            .and_then(|records| records.iter().enumerate().next_back())
        else {
            return Ok(LastEvent::absent());
        };
        Ok(LastEvent {
            event: self.decode(&streams, stream, position, record)?,
            version: version::from_zero_based(position as u64),
        })
    }

    async fn read_stream_event<'a>(
        &'a self,
        stream: &'a str,
        version: u64,
    ) -> Result<Option<Envelope<Self::Event>>, Self::Error> {
        let Some(position) = version::to_zero_based(version) else {
            return Ok(None);
        };
        let streams = self.streams.read().expect("in-memory store lock poisoned");
        let Some(record) = streams
            .get(stream)
            .and_then(|records| records.get(position as usize))
        else {
            return Ok(None);
        };
        self.decode(&streams, stream, position as usize, record)
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        self.streams
            .write()
            .expect("in-memory store lock poisoned")
            .clear();
        tracing::debug!("cleared in-memory event store");
        Ok(())
    }
}
