use std::{marker::PhantomData, sync::Arc};

use eventide_core::{
    concurrency::WrongExpectedVersion,
    event::{DecodeFailures, Envelope, Event, EventPayload},
    store::{AppendError, EventStore, LastEvent, NonEmpty, ReadResult, encode_batch},
    version,
};

use crate::{
    error::Error,
    log::{AppendOutcome, EventLog, ExpectedRevision, LogRecord, ReadOutcome, ResolvedRecord},
    wire,
};

/// Number of records requested per forward read.
pub const PAGE_SIZE: usize = 256;

/// [`EventStore`] over an [`EventLog`].
///
/// The log client is shared: construct it once at startup and hand the same
/// `Arc` to every store that needs it.
pub struct LogStore<L, E> {
    log: Arc<L>,
    decode_failures: DecodeFailures,
    _event: PhantomData<fn() -> E>,
}

impl<L, E> Clone for LogStore<L, E> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            decode_failures: self.decode_failures.clone(),
            _event: PhantomData,
        }
    }
}

impl<L: EventLog, E: EventPayload> LogStore<L, E> {
    #[must_use]
    pub fn new(log: Arc<L>) -> Self {
        Self {
            log,
            decode_failures: DecodeFailures::new(),
            _event: PhantomData,
        }
    }

    #[must_use]
    pub fn log(&self) -> &L {
        &self.log
    }

    /// Number of stored events skipped on read because they failed to decode.
    #[must_use]
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.count()
    }

    fn expected_revision(expected_version: u64) -> ExpectedRevision {
        version::to_zero_based(expected_version)
            .map_or(ExpectedRevision::NoStream, ExpectedRevision::Exact)
    }

    /// Decode one resolved record, `None` if it must be skipped.
    fn decode(&self, stream: &str, record: &ResolvedRecord) -> Option<Envelope<E>> {
        let Some(event) = &record.event else {
            if let Some(link) = &record.link {
                tracing::warn!(
                    stream,
                    revision = link.revision,
                    link = %String::from_utf8_lossy(&link.data),
                    "link points at a missing event; skipping"
                );
            }
            return None;
        };
        match wire::decode(event) {
            Ok(envelope) => Some(envelope),
            Err(error) => {
                self.decode_failures.record();
                tracing::error!(
                    stream,
                    revision = event.revision,
                    event_type = %event.event_type,
                    event_id = %event.event_id,
                    %error,
                    "skipping event that failed to decode"
                );
                None
            }
        }
    }
}

impl<L: EventLog, E: EventPayload> EventStore for LogStore<L, E> {
    type Error = Error<L::Error>;
    type Event = E;

    #[tracing::instrument(skip(self, events), fields(events_len = events.len()))]
    async fn append<'a>(
        &'a self,
        stream: &'a str,
        expected_version: u64,
        events: NonEmpty<Event<Self::Event>>,
    ) -> Result<u64, AppendError<Self::Error>> {
        let encoded = encode_batch(&events)?;
        let mut records: Vec<LogRecord> = Vec::with_capacity(events.len());
        for (index, (event, data)) in events.iter().zip(&encoded).enumerate() {
            let record = match (event, data) {
                (Event::Domain(envelope), Some(data)) => wire::domain_record(envelope, data)
                    .map_err(|error| AppendError::Encode {
                        index,
                        reason: error.to_string(),
                    })?,
                (Event::Link(link), _) => {
                    wire::link_record(link).ok_or_else(|| AppendError::Encode {
                        index,
                        reason: format!("link to `{}` points at version 0", link.stream_name),
                    })?
                }
                (Event::Domain(_), None) => {
                    return Err(AppendError::Encode {
                        index,
                        reason: "domain event was not encoded".to_owned(),
                    });
                }
            };
            records.push(record);
        }

        let count = records.len() as u64;
        let outcome = self
            .log
            .append(stream, Self::expected_revision(expected_version), records)
            .await
            .map_err(|error| AppendError::store(Error::Log(error)))?;
        match outcome {
            AppendOutcome::Written { last_revision } => {
                tracing::debug!(
                    events_appended = count,
                    version = version::from_zero_based(last_revision),
                    "events appended to stream"
                );
                Ok(count)
            }
            AppendOutcome::WrongExpectedRevision { current } => {
                let actual = current.map_or(version::NO_STREAM, version::from_zero_based);
                tracing::debug!(actual, "version mismatch, rejecting append");
                Err(WrongExpectedVersion::new(stream, expected_version, Some(actual)).into())
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn read_stream_from_event<'a>(
        &'a self,
        stream: &'a str,
        from_version: u64,
    ) -> ReadResult<Self::Event, Self::Error> {
        let mut revision =
            version::to_zero_based(version::clamp_from_version(from_version)).unwrap_or_default();
        let mut out = Vec::new();
        let mut pages = 0_usize;
        loop {
            let outcome = self
                .log
                .read_forward(stream, revision, PAGE_SIZE)
                .await
                .map_err(Error::Log)?;
            pages += 1;
            let (records, end_of_stream) = match outcome {
                ReadOutcome::Records {
                    records,
                    end_of_stream,
                } => (records, end_of_stream),
                ReadOutcome::NotFound if pages == 1 => return Ok(Vec::new()),
                ReadOutcome::NotFound | ReadOutcome::StreamDeleted => {
                    tracing::error!(stream, pages, "stream deleted during read");
                    return Err(Error::StreamDeleted {
                        stream: stream.to_owned(),
                    });
                }
            };

            let last = records
                .iter()
                .filter_map(ResolvedRecord::original)
                .map(|r| r.revision)
                .max();
            out.extend(records.iter().filter_map(|record| self.decode(stream, record)));
            match last {
                Some(last) if !end_of_stream => revision = last + 1,
                _ => break,
            }
        }
        tracing::trace!(events_read = out.len(), pages, "read stream");
        Ok(out)
    }

    async fn read_last_event<'a>(
        &'a self,
        stream: &'a str,
    ) -> Result<LastEvent<Self::Event>, Self::Error> {
        let outcome = self.log.read_last(stream).await.map_err(Error::Log)?;
        let record = match outcome {
            ReadOutcome::Records { records, .. } => records.into_iter().next(),
            ReadOutcome::NotFound => None,
            ReadOutcome::StreamDeleted => {
                return Err(Error::StreamDeleted {
                    stream: stream.to_owned(),
                });
            }
        };
        let Some(record) = record else {
            return Ok(LastEvent::absent());
        };
        let Some(original) = record.original() else {
            return Ok(LastEvent::absent());
        };
        Ok(LastEvent {
            version: version::from_zero_based(original.revision),
            event: self.decode(stream, &record),
        })
    }

    async fn read_stream_event<'a>(
        &'a self,
        stream: &'a str,
        version: u64,
    ) -> Result<Option<Envelope<Self::Event>>, Self::Error> {
        let Some(revision) = version::to_zero_based(version) else {
            return Ok(None);
        };
        let outcome = self
            .log
            .read_forward(stream, revision, 1)
            .await
            .map_err(Error::Log)?;
        match outcome {
            ReadOutcome::Records { records, .. } => Ok(records
                .first()
                .filter(|record| record.original().is_some_and(|r| r.revision == revision))
                .and_then(|record| self.decode(stream, record))),
            ReadOutcome::NotFound => Ok(None),
            ReadOutcome::StreamDeleted => Err(Error::StreamDeleted {
                stream: stream.to_owned(),
            }),
        }
    }

    async fn clear(&self) -> Result<(), Self::Error> {
        self.log.clear().await.map_err(Error::Log)?;
        tracing::debug!("cleared event log");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use eventide_core::{
        event::LinkEvent,
        test::{TestEvent, added, names, stream_name},
    };
    use nonempty::{NonEmpty, nonempty};
    use uuid::Uuid;

    use super::*;
    use crate::memory::MemoryLog;

    /// Records every forward read and can delete the stream after the first
    /// page.
    #[derive(Default)]
    struct ObservedLog {
        inner: MemoryLog,
        pages: Mutex<Vec<(u64, usize)>>,
        delete_after_first_page: bool,
        reads: AtomicUsize,
    }

    impl EventLog for ObservedLog {
        type Error = std::convert::Infallible;

        async fn append<'a>(
            &'a self,
            stream: &'a str,
            expected: ExpectedRevision,
            records: Vec<LogRecord>,
        ) -> Result<AppendOutcome, Self::Error> {
            self.inner.append(stream, expected, records).await
        }

        async fn read_forward<'a>(
            &'a self,
            stream: &'a str,
            from: u64,
            max_count: usize,
        ) -> Result<ReadOutcome, Self::Error> {
            self.pages.lock().unwrap().push((from, max_count));
            let outcome = self.inner.read_forward(stream, from, max_count).await;
            if self.delete_after_first_page && self.reads.fetch_add(1, Ordering::SeqCst) == 0 {
                self.inner.delete_stream(stream);
            }
            outcome
        }

        async fn read_last<'a>(&'a self, stream: &'a str) -> Result<ReadOutcome, Self::Error> {
            self.inner.read_last(stream).await
        }

        async fn clear(&self) -> Result<(), Self::Error> {
            self.inner.clear().await
        }
    }

    fn many(count: usize) -> NonEmpty<Event<TestEvent>> {
        NonEmpty::from_vec((0..count).map(|i| added(&i.to_string())).collect()).unwrap()
    }

    #[tokio::test]
    async fn forward_reads_page_in_fixed_batches() {
        let log = Arc::new(ObservedLog::default());
        let store: LogStore<_, TestEvent> = LogStore::new(Arc::clone(&log));
        let stream = stream_name("Large");
        store.append(&stream, 0, many(600)).await.unwrap();

        assert_eq!(store.read_stream(&stream).await.unwrap().len(), 600);
        assert_eq!(
            *log.pages.lock().unwrap(),
            [(0, PAGE_SIZE), (256, PAGE_SIZE), (512, PAGE_SIZE)]
        );
    }

    #[tokio::test]
    async fn stream_deleted_mid_read_is_fatal() {
        let log = Arc::new(ObservedLog {
            delete_after_first_page: true,
            ..ObservedLog::default()
        });
        let store: LogStore<_, TestEvent> = LogStore::new(Arc::clone(&log));
        let stream = stream_name("Doomed");
        store.append(&stream, 0, many(300)).await.unwrap();

        let result = store.read_stream(&stream).await;
        assert!(matches!(result, Err(Error::StreamDeleted { .. })));
    }

    #[tokio::test]
    async fn deleted_streams_are_not_missing_streams() {
        let log = Arc::new(MemoryLog::new());
        let store: LogStore<_, TestEvent> = LogStore::new(Arc::clone(&log));
        let stream = stream_name("Gone");
        store.append(&stream, 0, many(2)).await.unwrap();
        log.delete_stream(&stream);

        assert!(matches!(
            store.read_stream(&stream).await,
            Err(Error::StreamDeleted { .. })
        ));
        assert!(store.read_stream(&stream_name("Never")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn undecodable_events_are_skipped_and_counted() {
        let log = Arc::new(MemoryLog::new());
        let store: LogStore<_, TestEvent> = LogStore::new(Arc::clone(&log));
        let stream = stream_name("Foo");
        store.append(&stream, 0, many(2)).await.unwrap();
        log.append(
            &stream,
            ExpectedRevision::Exact(1),
            vec![LogRecord {
                event_id: Uuid::new_v4(),
                event_type: "Tests.Renamed".to_owned(),
                data: b"{}".to_vec(),
                metadata: b"{}".to_vec(),
            }],
        )
        .await
        .unwrap();
        store
            .append(&stream, 3, nonempty![added("after")])
            .await
            .unwrap();

        let read = store.read_stream(&stream).await.unwrap();
        assert_eq!(names(&read), ["0", "1", "after"]);
        assert_eq!(store.decode_failures(), 1);
        assert!(store.read_stream_event(&stream, 3).await.unwrap().is_none());
        assert_eq!(store.current_version(&stream).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn conflicts_report_the_public_version() {
        let store: LogStore<_, TestEvent> = LogStore::new(Arc::new(MemoryLog::new()));
        let stream = stream_name("Foo");
        store.append(&stream, 0, many(3)).await.unwrap();

        match store.append(&stream, 1, many(1)).await {
            Err(AppendError::Conflict(conflict)) => {
                assert_eq!(conflict.expected, 1);
                assert_eq!(conflict.actual, Some(3));
            }
            other => panic!("expected a conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn links_are_written_in_the_native_format() {
        let log = Arc::new(MemoryLog::new());
        let store: LogStore<_, TestEvent> = LogStore::new(Arc::clone(&log));
        let source = stream_name("List");
        store.append(&source, 0, many(2)).await.unwrap();
        let links = stream_name("ReadModel");
        store
            .append(
                &links,
                0,
                nonempty![Event::Link(LinkEvent::new(&source, 2, Uuid::new_v4()))],
            )
            .await
            .unwrap();

        let raw = log.records(&links);
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].event_type, "$>");
        assert_eq!(raw[0].data, format!("1@{source}").into_bytes());
    }
}
