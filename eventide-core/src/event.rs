//! Events, headers and payload codecs.
//!
//! A stream holds [`Event`]s: either a domain event wrapped in an
//! [`Envelope`] (typed payload plus [`Headers`]), or a [`LinkEvent`] pointing
//! at an event physically stored in another stream. Reads always return
//! envelopes; links are resolved by the store.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use uuid::Uuid;

/// Error returned when a stored event cannot be turned back into a payload.
#[derive(Debug, Error)]
pub enum EventDecodeError {
    /// The event kind was not recognized by this payload type.
    #[error("unknown event kind `{kind}`, expected one of {expected:?}")]
    UnknownKind {
        /// The unrecognized event kind string.
        kind: String,
        /// The event kinds this payload type can handle.
        expected: &'static [&'static str],
    },
    /// The payload did not match the shape of its kind.
    #[error("malformed `{kind}` payload: {source}")]
    Payload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    /// The stored headers could not be read.
    #[error("malformed event headers: {0}")]
    Headers(#[source] serde_json::Error),
}

/// Sum type of the domain events a store reads and writes.
///
/// Each variant carries a stable [`kind`](Self::kind) tag (conventionally the
/// fully qualified type name) which is persisted next to the JSON payload and
/// used to route stored data back to the right variant. Implementations are
/// an explicit `match`, built at compile time:
///
/// ```
/// use eventide_core::event::{EventDecodeError, EventPayload, decode_as};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// struct ItemAdded {
///     name: String,
/// }
///
/// #[derive(Clone, Debug)]
/// enum ListEvent {
///     ItemAdded(ItemAdded),
/// }
///
/// impl EventPayload for ListEvent {
///     const EVENT_KINDS: &'static [&'static str] = &["Lists.ItemAdded"];
///
///     fn kind(&self) -> &'static str {
///         match self {
///             Self::ItemAdded(_) => "Lists.ItemAdded",
///         }
///     }
///
///     fn encode(&self) -> Result<serde_json::Value, serde_json::Error> {
///         match self {
///             Self::ItemAdded(e) => serde_json::to_value(e),
///         }
///     }
///
///     fn decode(kind: &str, data: serde_json::Value) -> Result<Self, EventDecodeError> {
///         match kind {
///             "Lists.ItemAdded" => decode_as(kind, data).map(Self::ItemAdded),
///             _ => Err(EventDecodeError::UnknownKind {
///                 kind: kind.to_owned(),
///                 expected: Self::EVENT_KINDS,
///             }),
///         }
///     }
/// }
/// ```
pub trait EventPayload: Clone + Send + Sync + Sized + 'static {
    /// Every kind [`decode`](Self::decode) accepts.
    const EVENT_KINDS: &'static [&'static str];

    /// Type tag persisted with the payload.
    fn kind(&self) -> &'static str;

    /// Serialize the payload body.
    fn encode(&self) -> Result<serde_json::Value, serde_json::Error>;

    /// Rebuild a payload from its kind and stored body.
    ///
    /// # Errors
    ///
    /// Returns [`EventDecodeError::UnknownKind`] for unrecognized kinds and
    /// [`EventDecodeError::Payload`] when the body has the wrong shape.
    fn decode(kind: &str, data: serde_json::Value) -> Result<Self, EventDecodeError>;
}

/// Deserialize a payload body, tagging failures with the event kind.
///
/// # Errors
///
/// Returns [`EventDecodeError::Payload`] when `data` does not match `T`.
pub fn decode_as<T: DeserializeOwned>(
    kind: &str,
    data: serde_json::Value,
) -> Result<T, EventDecodeError> {
    serde_json::from_value(data).map_err(|source| EventDecodeError::Payload {
        kind: kind.to_owned(),
        source,
    })
}

/// Message headers carried by every domain event.
///
/// Serialized field names are part of the wire format and must round-trip
/// unchanged across every backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Headers {
    pub correlation_id: Uuid,
    pub user_id: Uuid,
    pub device_id: Uuid,
    pub message_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
}

impl Headers {
    /// Headers for a new message with a fresh message id.
    #[must_use]
    pub fn new(correlation_id: Uuid, user_id: Uuid, device_id: Uuid) -> Self {
        Self {
            correlation_id,
            user_id,
            device_id,
            message_id: Uuid::new_v4(),
            transaction_id: None,
            causation_id: None,
        }
    }

    /// Headers for a message caused by `self`: same correlation, user and
    /// device, fresh message id, causation pointing at `self`.
    #[must_use]
    pub fn caused(&self) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            causation_id: Some(self.message_id),
            ..*self
        }
    }

    #[must_use]
    pub const fn with_transaction(mut self, transaction_id: Uuid) -> Self {
        self.transaction_id = Some(transaction_id);
        self
    }
}

/// A domain event payload together with its headers.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope<E> {
    pub payload: E,
    pub headers: Headers,
}

impl<E> Envelope<E> {
    pub const fn new(payload: E, headers: Headers) -> Self {
        Self { payload, headers }
    }
}

impl<E: EventPayload> Envelope<E> {
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }
}

/// Pointer to "the event at `event_version` in stream `stream_name`".
///
/// Lets a read-model stream reference events stored in an aggregate's stream
/// without copying them.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LinkEvent {
    pub event_id: Uuid,
    /// 1-based version of the target event.
    pub event_version: u64,
    pub stream_name: String,
}

impl LinkEvent {
    #[must_use]
    pub fn new(stream_name: impl Into<String>, event_version: u64, event_id: Uuid) -> Self {
        Self {
            event_id,
            event_version,
            stream_name: stream_name.into(),
        }
    }
}

/// Anything that can be appended to a stream.
#[derive(Clone, Debug, PartialEq)]
pub enum Event<E> {
    Domain(Envelope<E>),
    Link(LinkEvent),
}

impl<E> From<Envelope<E>> for Event<E> {
    fn from(envelope: Envelope<E>) -> Self {
        Self::Domain(envelope)
    }
}

impl<E> From<LinkEvent> for Event<E> {
    fn from(link: LinkEvent) -> Self {
        Self::Link(link)
    }
}

/// Count of stored events a store skipped because they could not be decoded.
///
/// Skipping keeps reads alive after an event type is renamed or removed, but
/// silently shrinks what a read-model sees. Stores bump this counter (and log
/// an error) for every skip so callers can alert on it.
#[derive(Clone, Debug, Default)]
pub struct DecodeFailures(Arc<AtomicU64>);

impl DecodeFailures {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}
