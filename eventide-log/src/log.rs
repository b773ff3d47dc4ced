use std::future::Future;

use uuid::Uuid;

/// Native expected revision of an append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// The stream must not exist yet.
    NoStream,
    /// The last event of the stream must be at this 0-based revision.
    Exact(u64),
}

/// An event ready to be written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogRecord {
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// An event as stored in the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub stream: String,
    /// 0-based position within `stream`.
    pub revision: u64,
    pub event_id: Uuid,
    pub event_type: String,
    pub data: Vec<u8>,
    pub metadata: Vec<u8>,
}

/// One entry of a read, with links already followed by the log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedRecord {
    /// The event itself, or the target of `link`. `None` when `link` points
    /// at an event that no longer exists.
    pub event: Option<RecordedEvent>,
    /// The link event that was read, if the entry was a link.
    pub link: Option<RecordedEvent>,
}

impl ResolvedRecord {
    /// The record actually stored in the stream being read.
    #[must_use]
    pub fn original(&self) -> Option<&RecordedEvent> {
        self.link.as_ref().or(self.event.as_ref())
    }
}

/// Result of a read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    Records {
        records: Vec<ResolvedRecord>,
        end_of_stream: bool,
    },
    /// The stream has never been written.
    NotFound,
    /// The stream existed and was deleted.
    StreamDeleted,
}

/// Result of an append.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Written; the stream's last event is now at `last_revision`.
    Written { last_revision: u64 },
    /// Rejected; `current` is the 0-based revision of the stream's last
    /// event, `None` if the stream does not exist.
    WrongExpectedRevision { current: Option<u64> },
}

/// Native primitives of an append-only event log.
pub trait EventLog: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append `records` atomically if the stream is at `expected`.
    fn append<'a>(
        &'a self,
        stream: &'a str,
        expected: ExpectedRevision,
        records: Vec<LogRecord>,
    ) -> impl Future<Output = Result<AppendOutcome, Self::Error>> + Send + 'a;

    /// Read at most `max_count` records forward from the 0-based revision
    /// `from`, resolving link events.
    fn read_forward<'a>(
        &'a self,
        stream: &'a str,
        from: u64,
        max_count: usize,
    ) -> impl Future<Output = Result<ReadOutcome, Self::Error>> + Send + 'a;

    /// Read the last record of a stream, resolving link events.
    fn read_last<'a>(
        &'a self,
        stream: &'a str,
    ) -> impl Future<Output = Result<ReadOutcome, Self::Error>> + Send + 'a;

    /// Remove every stream.
    fn clear(&self) -> impl Future<Output = Result<(), Self::Error>> + Send + '_;
}
