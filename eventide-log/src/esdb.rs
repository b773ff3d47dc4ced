//! [`EventLog`] over the EventStoreDB gRPC client.

use std::collections::BTreeSet;

use bytes::Bytes;
use eventstore::{
    AppendToStreamOptions, Client, ClientSettings, CurrentRevision, DeleteStreamOptions,
    EventData, ReadAllOptions, ReadStreamOptions, StreamPosition,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::log::{
    AppendOutcome, EventLog, ExpectedRevision, LogRecord, ReadOutcome, RecordedEvent,
    ResolvedRecord,
};

const URL_VAR: &str = "EVENTIDE_ESDB_URL";

/// Connection settings of an EventStoreDB node or cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// `esdb://` or `esdb+discover://` connection string.
    pub connection_string: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            connection_string: "esdb://localhost:2113?tls=false".to_owned(),
        }
    }
}

impl Settings {
    /// Defaults, overridden by `EVENTIDE_ESDB_URL` when set.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var(URL_VAR)
            .map(|connection_string| Self { connection_string })
            .unwrap_or_default()
    }
}

#[derive(Debug, Error)]
pub enum EsdbError {
    #[error("invalid connection string: {0}")]
    Settings(String),
    #[error(transparent)]
    Client(#[from] eventstore::Error),
}

/// EventStoreDB-backed event log.
#[derive(Clone)]
pub struct EsdbLog {
    client: Client,
}

impl EsdbLog {
    /// Create a client. Connections are established lazily.
    pub fn connect(settings: &Settings) -> Result<Self, EsdbError> {
        let parsed = settings
            .connection_string
            .parse::<ClientSettings>()
            .map_err(|error| EsdbError::Settings(error.to_string()))?;
        let client =
            Client::new(parsed).map_err(|error| EsdbError::Settings(error.to_string()))?;
        tracing::debug!("created EventStoreDB client");
        Ok(Self { client })
    }

    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn read(
        &self,
        stream: &str,
        options: &ReadStreamOptions,
    ) -> Result<ReadOutcome, EsdbError> {
        let mut read = match self.client.read_stream(stream, options).await {
            Ok(read) => read,
            Err(eventstore::Error::ResourceNotFound) => return Ok(ReadOutcome::NotFound),
            Err(eventstore::Error::ResourceDeleted) => return Ok(ReadOutcome::StreamDeleted),
            Err(error) => return Err(error.into()),
        };
        let mut records = Vec::new();
        loop {
            match read.next().await {
                Ok(Some(resolved)) => records.push(ResolvedRecord {
                    event: resolved.event.map(recorded),
                    link: resolved.link.map(recorded),
                }),
                Ok(None) => break,
                Err(eventstore::Error::ResourceNotFound) => return Ok(ReadOutcome::NotFound),
                Err(eventstore::Error::ResourceDeleted) => return Ok(ReadOutcome::StreamDeleted),
                Err(error) => return Err(error.into()),
            }
        }
        Ok(ReadOutcome::Records {
            records,
            end_of_stream: false,
        })
    }

    /// Every user stream with an event still in `$all`.
    async fn user_streams(&self) -> Result<BTreeSet<String>, EsdbError> {
        let options = ReadAllOptions::default()
            .position(StreamPosition::Start)
            .forwards();
        let mut read = self.client.read_all(&options).await?;
        let mut streams = BTreeSet::new();
        while let Some(resolved) = read.next().await? {
            if let Some(event) = resolved.event.filter(|e| is_user_stream(&e.stream_id)) {
                streams.insert(event.stream_id);
            }
        }
        Ok(streams)
    }
}

/// Streams whose name starts with `$` belong to the server.
fn is_user_stream(stream: &str) -> bool {
    !stream.is_empty() && !stream.starts_with('$')
}

fn recorded(event: eventstore::RecordedEvent) -> RecordedEvent {
    RecordedEvent {
        stream: event.stream_id,
        revision: event.revision,
        event_id: event.id,
        event_type: event.event_type,
        data: event.data.to_vec(),
        metadata: event.custom_metadata.to_vec(),
    }
}

fn event_data(record: LogRecord) -> EventData {
    EventData::binary(record.event_type, Bytes::from(record.data))
        .id(record.event_id)
        .metadata(Bytes::from(record.metadata))
}

impl EventLog for EsdbLog {
    type Error = EsdbError;

    #[tracing::instrument(skip(self, records), fields(records_len = records.len()))]
    async fn append<'a>(
        &'a self,
        stream: &'a str,
        expected: ExpectedRevision,
        records: Vec<LogRecord>,
    ) -> Result<AppendOutcome, Self::Error> {
        let expected = match expected {
            ExpectedRevision::NoStream => eventstore::ExpectedRevision::NoStream,
            ExpectedRevision::Exact(revision) => eventstore::ExpectedRevision::Exact(revision),
        };
        let options = AppendToStreamOptions::default().expected_revision(expected);
        let events: Vec<EventData> = records.into_iter().map(event_data).collect();
        match self.client.append_to_stream(stream, &options, events).await {
            Ok(result) => Ok(AppendOutcome::Written {
                last_revision: result.next_expected_version,
            }),
            Err(eventstore::Error::WrongExpectedVersion { current, .. }) => {
                let current = match current {
                    CurrentRevision::Current(revision) => Some(revision),
                    CurrentRevision::NoStream => None,
                };
                Ok(AppendOutcome::WrongExpectedRevision { current })
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn read_forward<'a>(
        &'a self,
        stream: &'a str,
        from: u64,
        max_count: usize,
    ) -> Result<ReadOutcome, Self::Error> {
        let options = ReadStreamOptions::default()
            .position(StreamPosition::Position(from))
            .forwards()
            .max_count(max_count)
            .resolve_link_tos();
        match self.read(stream, &options).await? {
            ReadOutcome::Records { records, .. } => {
                let end_of_stream = records.len() < max_count;
                Ok(ReadOutcome::Records {
                    records,
                    end_of_stream,
                })
            }
            other => Ok(other),
        }
    }

    async fn read_last<'a>(&'a self, stream: &'a str) -> Result<ReadOutcome, Self::Error> {
        let options = ReadStreamOptions::default()
            .position(StreamPosition::End)
            .backwards()
            .max_count(1)
            .resolve_link_tos();
        match self.read(stream, &options).await? {
            ReadOutcome::Records { records, .. } => Ok(ReadOutcome::Records {
                records,
                end_of_stream: true,
            }),
            other => Ok(other),
        }
    }

    /// Soft-delete every user stream. Deleted streams read as missing and
    /// can be written again.
    #[tracing::instrument(skip(self))]
    async fn clear(&self) -> Result<(), Self::Error> {
        let streams = self.user_streams().await?;
        let options = DeleteStreamOptions::default();
        for stream in &streams {
            match self.client.delete_stream(stream.as_str(), &options).await {
                Ok(_) => {}
                Err(eventstore::Error::ResourceNotFound | eventstore::Error::ResourceDeleted) => {
                    tracing::trace!(stream, "stream already deleted");
                }
                Err(error) => return Err(error.into()),
            }
        }
        tracing::debug!(streams = streams.len(), "soft-deleted user streams");
        Ok(())
    }
}
