//! Wire format of events in the log.
//!
//! Domain events are written with their kind as the event type, the JSON
//! payload as data and the headers as JSON metadata. Link events use the
//! log's native link type `$>` and a `<revision>@<stream>` body, where the
//! revision is the target's 0-based native revision.

use eventide_core::{
    event::{Envelope, EventDecodeError, EventPayload, Headers, LinkEvent},
    version,
};

use uuid::Uuid;

use crate::log::{LogRecord, RecordedEvent};

/// Event type of native link events.
pub const LINK_EVENT_TYPE: &str = "$>";

/// Encode a domain event whose payload is already JSON.
///
/// Every record gets a fresh event id: the log deduplicates appends by event
/// id, and one message may yield several events.
///
/// # Errors
///
/// Returns the serializer error if the headers cannot be encoded.
pub fn domain_record<E: EventPayload>(
    envelope: &Envelope<E>,
    data: &serde_json::Value,
) -> Result<LogRecord, serde_json::Error> {
    Ok(LogRecord {
        event_id: Uuid::new_v4(),
        event_type: envelope.kind().to_owned(),
        data: serde_json::to_vec(data)?,
        metadata: serde_json::to_vec(&envelope.headers)?,
    })
}

/// Encode a link event. `None` for a link to version 0.
#[must_use]
pub fn link_record(link: &LinkEvent) -> Option<LogRecord> {
    let revision = version::to_zero_based(link.event_version)?;
    Some(LogRecord {
        event_id: link.event_id,
        event_type: LINK_EVENT_TYPE.to_owned(),
        data: format!("{revision}@{}", link.stream_name).into_bytes(),
        metadata: Vec::new(),
    })
}

/// Split a link body into the target's native revision and stream.
#[must_use]
pub fn parse_link(body: &[u8]) -> Option<(u64, &str)> {
    let body = std::str::from_utf8(body).ok()?;
    let (revision, stream) = body.split_once('@')?;
    if stream.is_empty() {
        return None;
    }
    Some((revision.parse().ok()?, stream))
}

/// Decode a recorded domain event.
///
/// # Errors
///
/// Returns [`EventDecodeError`] for malformed headers or payloads and for
/// event types `E` does not know.
pub fn decode<E: EventPayload>(event: &RecordedEvent) -> Result<Envelope<E>, EventDecodeError> {
    let headers: Headers =
        serde_json::from_slice(&event.metadata).map_err(EventDecodeError::Headers)?;
    let data = serde_json::from_slice(&event.data).map_err(|source| EventDecodeError::Payload {
        kind: event.event_type.clone(),
        source,
    })?;
    Ok(Envelope::new(E::decode(&event.event_type, data)?, headers))
}
