use eventide_core::{
    concurrency::WrongExpectedVersion,
    event::{Event, EventPayload, Headers},
    store::{AppendError, NonEmpty, encode_batch},
    version,
};
use sqlx::{Postgres, QueryBuilder, types::Json};
use uuid::Uuid;

use super::{LINK_KIND, Store};
use crate::{
    Error,
    error::{is_unique_violation, to_db_version},
};

/// Rows per `INSERT`, keeping the bind count under the protocol limit.
const INSERT_CHUNK: usize = 1_000;

/// One `evt_events` row before its version is assigned.
struct NewRow {
    event_id: Uuid,
    kind: String,
    data: Option<Json<serde_json::Value>>,
    headers: Option<Json<Headers>>,
    link_stream: Option<String>,
    link_version: Option<i64>,
}

type AppendResult = Result<u64, AppendError<Error>>;

fn store_error(error: impl Into<Error>) -> AppendError<Error> {
    AppendError::store(error.into())
}

impl<E: EventPayload> Store<E> {
    fn prepare_rows(events: &NonEmpty<Event<E>>) -> Result<Vec<NewRow>, AppendError<Error>> {
        let encoded = encode_batch(events)?;
        events
            .iter()
            .zip(encoded)
            .map(|(event, data)| -> Result<NewRow, AppendError<Error>> {
                Ok(match event {
                    Event::Domain(envelope) => NewRow {
                        event_id: Uuid::new_v4(),
                        kind: envelope.kind().to_owned(),
                        data: data.map(Json),
                        headers: Some(Json(envelope.headers)),
                        link_stream: None,
                        link_version: None,
                    },
                    Event::Link(link) => NewRow {
                        event_id: link.event_id,
                        kind: LINK_KIND.to_owned(),
                        data: None,
                        headers: None,
                        link_stream: Some(link.stream_name.clone()),
                        link_version: Some(to_db_version(link.event_version).map_err(store_error)?),
                    },
                })
            })
            .collect()
    }

    /// Append under a `FOR UPDATE` lock on the stream row.
    ///
    /// The native check is on the version the stream will have after the
    /// append: `current + count == expected_version + count`.
    pub(super) async fn append_events(
        &self,
        stream: &str,
        expected_version: u64,
        events: &NonEmpty<Event<E>>,
    ) -> AppendResult {
        let rows = Self::prepare_rows(events)?;
        let count = rows.len() as u64;
        let conflict = |actual: Option<u64>| -> AppendError<Error> {
            WrongExpectedVersion::new(stream, expected_version, actual).into()
        };
        // No stream can reach a version past the BIGINT column range.
        let Some((expected_after, db_expected_after)) =
            version::expected_after_append(expected_version, rows.len())
                .and_then(|after| Some((after, to_db_version(after).ok()?)))
        else {
            tracing::debug!("expected version beyond any reachable version, rejecting append");
            return Err(conflict(None));
        };
        let translate = |error: sqlx::Error| -> AppendError<Error> {
            if is_unique_violation(&error) {
                tracing::debug!(%error, "concurrent append detected by unique constraint");
                conflict(None)
            } else {
                store_error(error)
            }
        };

        let mut tx = self.pool.begin().await.map_err(store_error)?;

        sqlx::query(
            r"
                INSERT INTO evt_streams (name, version)
                VALUES ($1, 0)
                ON CONFLICT (name) DO NOTHING
                ",
        )
        .bind(stream)
        .execute(&mut *tx)
        .await
        .map_err(translate)?;

        let current: i64 = sqlx::query_scalar(
            r"
                SELECT version
                FROM evt_streams
                WHERE name = $1
                FOR UPDATE
                ",
        )
        .bind(stream)
        .fetch_one(&mut *tx)
        .await
        .map_err(store_error)?;
        let current = crate::error::from_db_version(current).map_err(store_error)?;

        if current + count != expected_after {
            tracing::debug!(actual = current, "version mismatch, rejecting append");
            return Err(conflict(Some(current)));
        }

        let mut next_version = current;
        for chunk in rows.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO evt_events \
                 (stream_name, version, event_id, kind, data, headers, link_stream, link_version) ",
            );
            let mut versions = Vec::with_capacity(chunk.len());
            for _ in chunk {
                next_version += 1;
                versions.push(to_db_version(next_version).map_err(store_error)?);
            }
            qb.push_values(chunk.iter().zip(versions), |mut b, (row, version)| {
                b.push_bind(stream);
                b.push_bind(version);
                b.push_bind(row.event_id);
                b.push_bind(&row.kind);
                b.push_bind(&row.data);
                b.push_bind(&row.headers);
                b.push_bind(&row.link_stream);
                b.push_bind(row.link_version);
            });
            qb.build().execute(&mut *tx).await.map_err(translate)?;
        }

        sqlx::query("UPDATE evt_streams SET version = $1 WHERE name = $2")
            .bind(db_expected_after)
            .bind(stream)
            .execute(&mut *tx)
            .await
            .map_err(translate)?;

        tx.commit().await.map_err(translate)?;

        tracing::debug!(
            events_appended = count,
            version = expected_after,
            "events appended to stream"
        );
        Ok(count)
    }
}
