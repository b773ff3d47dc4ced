//! In-process [`EventLog`].
//!
//! Behaves like a single-node log server: 0-based revisions, native
//! expected revisions, `$>` link events resolved one hop deep on read, and
//! deleted streams that read as deleted rather than missing.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, RwLock},
};

use crate::{
    log::{
        AppendOutcome, EventLog, ExpectedRevision, LogRecord, ReadOutcome, RecordedEvent,
        ResolvedRecord,
    },
    wire::{LINK_EVENT_TYPE, parse_link},
};

#[derive(Debug, Default)]
struct StreamState {
    events: Vec<RecordedEvent>,
    deleted: bool,
}

type Streams = HashMap<String, StreamState>;

/// Thread-safe in-memory event log.
#[derive(Clone, Debug, Default)]
pub struct MemoryLog {
    streams: Arc<RwLock<Streams>>,
}

impl MemoryLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete a stream. Later reads report it as deleted and appends to it
    /// are rejected.
    pub fn delete_stream(&self, stream: &str) {
        let mut streams = self.streams.write().expect("memory log lock poisoned");
        let state = streams.entry(stream.to_owned()).or_default();
        state.events.clear();
        state.deleted = true;
    }

    /// Raw records of a stream, links unresolved.
    #[must_use]
    pub fn records(&self, stream: &str) -> Vec<RecordedEvent> {
        self.streams
            .read()
            .expect("memory log lock poisoned")
            .get(stream)
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }

    fn resolve(streams: &Streams, event: &RecordedEvent) -> ResolvedRecord {
        if event.event_type != LINK_EVENT_TYPE {
            return ResolvedRecord {
                event: Some(event.clone()),
                link: None,
            };
        }
        let target = parse_link(&event.data).and_then(|(revision, stream)| {
            let state = streams.get(stream)?;
            state.events.get(usize::try_from(revision).ok()?).cloned()
        });
        ResolvedRecord {
            event: target,
            link: Some(event.clone()),
        }
    }
}

impl EventLog for MemoryLog {
    type Error = Infallible;

    async fn append<'a>(
        &'a self,
        stream: &'a str,
        expected: ExpectedRevision,
        records: Vec<LogRecord>,
    ) -> Result<AppendOutcome, Self::Error> {
        let mut streams = self.streams.write().expect("memory log lock poisoned");
        let state = streams.get(stream);
        let current = state
            .filter(|s| !s.deleted)
            .and_then(|s| s.events.len().checked_sub(1))
            .map(|r| r as u64);
        let accepted = match expected {
            ExpectedRevision::NoStream => current.is_none() && !state.is_some_and(|s| s.deleted),
            ExpectedRevision::Exact(revision) => current == Some(revision),
        };
        if !accepted {
            return Ok(AppendOutcome::WrongExpectedRevision { current });
        }

        let state = streams.entry(stream.to_owned()).or_default();
        let mut revision = state.events.len() as u64;
        for record in records {
            state.events.push(RecordedEvent {
                stream: stream.to_owned(),
                revision,
                event_id: record.event_id,
                event_type: record.event_type,
                data: record.data,
                metadata: record.metadata,
            });
            revision += 1;
        }
        Ok(AppendOutcome::Written {
            last_revision: revision.saturating_sub(1),
        })
    }

    async fn read_forward<'a>(
        &'a self,
        stream: &'a str,
        from: u64,
        max_count: usize,
    ) -> Result<ReadOutcome, Self::Error> {
        let streams = self.streams.read().expect("memory log lock poisoned");
        let Some(state) = streams.get(stream) else {
            return Ok(ReadOutcome::NotFound);
        };
        if state.deleted {
            return Ok(ReadOutcome::StreamDeleted);
        }
        let start = usize::try_from(from).unwrap_or(usize::MAX).min(state.events.len());
        let end = start.saturating_add(max_count).min(state.events.len());
        let records = state.events[start..end]
            .iter()
            .map(|event| Self::resolve(&streams, event))
            .collect();
        Ok(ReadOutcome::Records {
            records,
            end_of_stream: end == state.events.len(),
        })
    }

    async fn read_last<'a>(&'a self, stream: &'a str) -> Result<ReadOutcome, Self::Error> {
        let streams = self.streams.read().expect("memory log lock poisoned");
        let Some(state) = streams.get(stream) else {
            return Ok(ReadOutcome::NotFound);
        };
        if state.deleted {
            return Ok(ReadOutcome::StreamDeleted);
        }
        Ok(ReadOutcome::Records {
            records: state
                .events
                .last()
                .map(|event| Self::resolve(&streams, event))
                .into_iter()
                .collect(),
            end_of_stream: true,
        })
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        self.streams.write().expect("memory log lock poisoned").clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn record(event_type: &str, data: &[u8]) -> LogRecord {
        LogRecord {
            event_id: Uuid::new_v4(),
            event_type: event_type.to_owned(),
            data: data.to_vec(),
            metadata: Vec::new(),
        }
    }

    #[tokio::test]
    async fn revisions_start_at_zero() {
        let log = MemoryLog::new();
        let written = log
            .append("s", ExpectedRevision::NoStream, vec![record("a", b"1"), record("b", b"2")])
            .await
            .unwrap();
        assert_eq!(written, AppendOutcome::Written { last_revision: 1 });

        let rejected = log
            .append("s", ExpectedRevision::NoStream, vec![record("c", b"3")])
            .await
            .unwrap();
        assert_eq!(rejected, AppendOutcome::WrongExpectedRevision { current: Some(1) });

        let written = log
            .append("s", ExpectedRevision::Exact(1), vec![record("c", b"3")])
            .await
            .unwrap();
        assert_eq!(written, AppendOutcome::Written { last_revision: 2 });
    }

    #[tokio::test]
    async fn links_resolve_one_hop() {
        let log = MemoryLog::new();
        log.append("target", ExpectedRevision::NoStream, vec![record("a", b"1")])
            .await
            .unwrap();
        log.append(
            "links",
            ExpectedRevision::NoStream,
            vec![record("$>", b"0@target"), record("$>", b"5@target")],
        )
        .await
        .unwrap();

        let ReadOutcome::Records { records, end_of_stream } =
            log.read_forward("links", 0, 10).await.unwrap()
        else {
            panic!("expected records");
        };
        assert!(end_of_stream);
        assert_eq!(records[0].event.as_ref().unwrap().stream, "target");
        assert_eq!(records[0].original().unwrap().stream, "links");
        assert!(records[1].event.is_none());
    }

    #[tokio::test]
    async fn deleted_streams_reject_appends_and_reads() {
        let log = MemoryLog::new();
        log.append("s", ExpectedRevision::NoStream, vec![record("a", b"1")])
            .await
            .unwrap();
        log.delete_stream("s");

        assert_eq!(log.read_forward("s", 0, 10).await.unwrap(), ReadOutcome::StreamDeleted);
        assert_eq!(log.read_last("s").await.unwrap(), ReadOutcome::StreamDeleted);
        let append = log
            .append("s", ExpectedRevision::NoStream, vec![record("b", b"2")])
            .await
            .unwrap();
        assert_eq!(append, AppendOutcome::WrongExpectedRevision { current: None });
        assert_eq!(log.read_forward("other", 0, 10).await.unwrap(), ReadOutcome::NotFound);
    }
}
