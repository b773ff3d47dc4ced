use sqlx::{Connection, PgConnection, PgPool};

use crate::{
    Error, Settings,
    error::{is_concurrent_create, quote_ident},
};

/// Create the working database unless it already exists.
///
/// Concurrent creators race between the existence check and `CREATE
/// DATABASE`; the loser's `42P04`/`23505` is treated as success.
pub(super) async fn ensure_database(settings: &Settings) -> Result<(), Error> {
    let mut admin = PgConnection::connect_with(&settings.admin_options()?).await?;

    let exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&settings.database)
            .fetch_one(&mut admin)
            .await?;

    if exists {
        tracing::trace!(database = %settings.database, "database already exists");
    } else {
        let ddl = format!("CREATE DATABASE {}", quote_ident(&settings.database));
        match sqlx::query(&ddl).execute(&mut admin).await {
            Ok(_) => tracing::debug!(database = %settings.database, "created database"),
            Err(error) if is_concurrent_create(&error) => {
                tracing::debug!(
                    database = %settings.database,
                    %error,
                    "database created concurrently"
                );
            }
            Err(source) => {
                return Err(Error::Bootstrap {
                    database: settings.database.clone(),
                    source,
                });
            }
        }
    }

    admin.close().await?;
    Ok(())
}

const SCHEMA: [&str; 3] = [
    r"
    CREATE TABLE IF NOT EXISTS evt_streams (
        name    TEXT PRIMARY KEY,
        version BIGINT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS evt_events (
        seq_id       BIGSERIAL PRIMARY KEY,
        stream_name  TEXT NOT NULL,
        version      BIGINT NOT NULL,
        event_id     UUID NOT NULL,
        kind         TEXT NOT NULL,
        data         JSONB NULL,
        headers      JSONB NULL,
        link_stream  TEXT NULL,
        link_version BIGINT NULL,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (stream_name, version)
    )
    ",
    r"CREATE INDEX IF NOT EXISTS evt_events_by_event_id ON evt_events(event_id)",
];

pub(super) async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in SCHEMA {
        match sqlx::query(statement).execute(pool).await {
            Ok(_) => {}
            Err(error) if is_concurrent_create(&error) => {
                tracing::debug!(%error, "schema object created concurrently");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(())
}
