use std::{future::Future, pin::Pin};

use eventide_core::{
    event::{Envelope, EventPayload, Headers},
    store::LastEvent,
    version,
};
use sqlx::{Row, postgres::PgRow, types::Json};

use super::{LINK_KIND, READ_BATCH, Store};
use crate::{
    Error,
    error::{from_db_version, to_db_version},
};

/// Links followed before a read gives up on a chain.
const MAX_LINK_DEPTH: usize = 16;

const COLUMNS: &str = "version, event_id, kind, data, headers, link_stream, link_version";

/// One decoded `evt_events` row.
enum StoredRow {
    Domain {
        version: u64,
        event_id: uuid::Uuid,
        kind: String,
        data: Option<serde_json::Value>,
        headers: Option<Headers>,
    },
    Link {
        version: u64,
        target_stream: String,
        target_version: u64,
    },
}

impl StoredRow {
    fn from_row(row: &PgRow) -> Result<Self, Error> {
        let version = from_db_version(row.try_get("version")?)?;
        let kind: String = row.try_get("kind")?;
        if kind == LINK_KIND {
            let target_stream: Option<String> = row.try_get("link_stream")?;
            let target_version: Option<i64> = row.try_get("link_version")?;
            return Ok(Self::Link {
                version,
                target_stream: target_stream.unwrap_or_default(),
                target_version: target_version.map_or(Ok(version::NO_STREAM), from_db_version)?,
            });
        }
        // Malformed metadata is reported as a decode failure, not a read
        // error.
        let headers: Option<Json<serde_json::Value>> = row.try_get("headers")?;
        let data: Option<Json<serde_json::Value>> = row.try_get("data")?;
        Ok(Self::Domain {
            version,
            event_id: row.try_get("event_id")?,
            kind,
            data: data.map(|d| d.0),
            headers: headers.and_then(|h| serde_json::from_value(h.0).ok()),
        })
    }

    const fn version(&self) -> u64 {
        match self {
            Self::Domain { version, .. } | Self::Link { version, .. } => *version,
        }
    }
}

type BoxedRead<'a, E> =
    Pin<Box<dyn Future<Output = Result<Option<Envelope<E>>, Error>> + Send + 'a>>;

impl<E: EventPayload> Store<E> {
    fn decode(&self, stream: &str, row: StoredRow) -> Option<Envelope<E>> {
        let StoredRow::Domain {
            version,
            event_id,
            kind,
            data,
            headers,
        } = row
        else {
            return None;
        };
        let decoded = match (headers, data) {
            (Some(headers), Some(data)) => E::decode(&kind, data)
                .map(|payload| Envelope::new(payload, headers))
                .map_err(|error| error.to_string()),
            (None, _) => Err("missing or malformed headers".to_owned()),
            (_, None) => Err("missing data".to_owned()),
        };
        match decoded {
            Ok(envelope) => Some(envelope),
            Err(reason) => {
                self.decode_failures.record();
                tracing::error!(
                    stream,
                    version,
                    event_type = %kind,
                    %event_id,
                    %reason,
                    "skipping event that failed to decode"
                );
                None
            }
        }
    }

    /// Decode a row, following it if it is a link.
    async fn resolve(
        &self,
        stream: &str,
        row: StoredRow,
        depth: usize,
    ) -> Result<Option<Envelope<E>>, Error> {
        match row {
            StoredRow::Link {
                version,
                target_stream,
                target_version,
            } => {
                if depth >= MAX_LINK_DEPTH {
                    return Err(Error::LinkDepthExceeded {
                        stream: stream.to_owned(),
                    });
                }
                let resolved = self.read_at(&target_stream, target_version, depth + 1).await?;
                if resolved.is_none() {
                    tracing::warn!(
                        stream,
                        version,
                        target_stream = %target_stream,
                        target_version,
                        "link points at a missing event; skipping"
                    );
                }
                Ok(resolved)
            }
            domain => Ok(self.decode(stream, domain)),
        }
    }

    /// Read the event at `version`, following links through a boxed future
    /// so the recursion has a finite type.
    ///
    /// Versions beyond the `BIGINT` column range cannot exist and read as
    /// absent.
    pub(super) fn read_at<'a>(
        &'a self,
        stream: &'a str,
        version: u64,
        depth: usize,
    ) -> BoxedRead<'a, E> {
        Box::pin(async move {
            if version == version::NO_STREAM {
                return Ok(None);
            }
            let Ok(db_version) = to_db_version(version) else {
                return Ok(None);
            };
            let row = sqlx::query(&format!(
                "SELECT {COLUMNS} FROM evt_events WHERE stream_name = $1 AND version = $2"
            ))
            .bind(stream)
            .bind(db_version)
            .fetch_optional(&self.pool)
            .await?;
            match row {
                Some(row) => self.resolve(stream, StoredRow::from_row(&row)?, depth).await,
                None => Ok(None),
            }
        })
    }

    pub(super) async fn read_from(
        &self,
        stream: &str,
        from_version: u64,
    ) -> Result<Vec<Envelope<E>>, Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM evt_events WHERE stream_name = $1 AND version >= $2 \
             ORDER BY version ASC LIMIT $3"
        );
        let mut next = version::clamp_from_version(from_version);
        let mut out = Vec::new();
        let mut batches = 0_usize;
        loop {
            // Past the column range: nothing more can be stored.
            let Ok(db_next) = to_db_version(next) else {
                break;
            };
            let rows = sqlx::query(&query)
                .bind(stream)
                .bind(db_next)
                .bind(READ_BATCH)
                .fetch_all(&self.pool)
                .await?;
            batches += 1;
            let fetched = rows.len();
            for row in &rows {
                let row = StoredRow::from_row(row)?;
                next = row.version() + 1;
                if let Some(envelope) = self.resolve(stream, row, 0).await? {
                    out.push(envelope);
                }
            }
            if (fetched as i64) < READ_BATCH {
                break;
            }
        }
        tracing::trace!(events_read = out.len(), batches, "read stream");
        Ok(out)
    }

    pub(super) async fn read_last(&self, stream: &str) -> Result<LastEvent<E>, Error> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM evt_events WHERE stream_name = $1 ORDER BY version DESC LIMIT 1"
        ))
        .bind(stream)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(LastEvent::absent());
        };
        let row = StoredRow::from_row(&row)?;
        let version = row.version();
        Ok(LastEvent {
            event: self.resolve(stream, row, 0).await?,
            version,
        })
    }
}
