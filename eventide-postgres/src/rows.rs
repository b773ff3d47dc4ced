//! Relational projection targets.
//!
//! Each entity type gets its own table, named after the type in
//! `snake_case`, with a typed `id` primary key and the entity as a `jsonb`
//! body. Tables are created on first use.

use std::{
    collections::HashSet,
    sync::{Arc, RwLock},
};

use eventide_core::{
    rows::{RowChange, RowError, RowSession, RowStore},
    schema::{Document, EntityDescriptor, KeyType, PrimaryKey},
};
use sqlx::{
    Connection, PgConnection, PgPool, Postgres,
    pool::PoolConnection,
    postgres::PgArguments,
    query::Query,
    types::Json,
};

use crate::error::{is_concurrent_create, is_unique_violation, quote_ident};

/// [`RowStore`] over a `PostgreSQL` pool.
#[derive(Clone)]
pub struct PgRowStore {
    pool: PgPool,
    tables: Arc<RwLock<HashSet<&'static str>>>,
}

impl PgRowStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables: Arc::default(),
        }
    }

    /// Create the table for `descriptor` unless this store already has.
    pub async fn ensure_table(&self, descriptor: &EntityDescriptor) -> Result<(), RowError> {
        let mut conn = self.pool.acquire().await.map_err(RowError::backend)?;
        ensure_table(&mut conn, &self.tables, descriptor).await
    }
}

/// Create the table for `descriptor` on `conn`, which must not be inside a
/// transaction.
async fn ensure_table(
    conn: &mut PgConnection,
    tables: &RwLock<HashSet<&'static str>>,
    descriptor: &EntityDescriptor,
) -> Result<(), RowError> {
    let entity_type = descriptor.entity_type();
    let known = tables
        .read()
        .expect("table cache lock poisoned")
        .contains(entity_type);
    if known {
        return Ok(());
    }
    let key_column = match descriptor.key_type() {
        KeyType::Uuid => "UUID",
        KeyType::Integer => "BIGINT",
        KeyType::Text => "TEXT",
    };
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} (id {key_column} PRIMARY KEY, body JSONB NOT NULL)",
        quote_ident(&descriptor.schema().table())
    );
    match sqlx::query(&ddl).execute(&mut *conn).await {
        Ok(_) => tracing::debug!(entity_type, "projection table ready"),
        Err(error) if is_concurrent_create(&error) => {
            tracing::debug!(entity_type, %error, "projection table created concurrently");
        }
        Err(error) => return Err(RowError::backend(error)),
    }
    tables
        .write()
        .expect("table cache lock poisoned")
        .insert(entity_type);
    Ok(())
}

fn bind_key<'q>(
    query: Query<'q, Postgres, PgArguments>,
    key: &'q PrimaryKey,
) -> Query<'q, Postgres, PgArguments> {
    match key {
        PrimaryKey::Uuid(id) => query.bind(id),
        PrimaryKey::Integer(id) => query.bind(id),
        PrimaryKey::Text(id) => query.bind(id.as_str()),
    }
}

impl RowStore for PgRowStore {
    type Session = PgRowSession;

    async fn begin(&self) -> Result<Self::Session, RowError> {
        let conn = self.pool.acquire().await.map_err(RowError::backend)?;
        Ok(PgRowSession {
            tables: Arc::clone(&self.tables),
            conn,
        })
    }
}

/// One pooled connection against the projection tables.
///
/// Reads and table creation run on the connection as they come. Changes are
/// written in a single transaction at commit, so dropping the session without
/// committing writes nothing. A session never holds more than one connection.
pub struct PgRowSession {
    tables: Arc<RwLock<HashSet<&'static str>>>,
    conn: PoolConnection<Postgres>,
}

impl PgRowSession {
    async fn apply(tx: &mut PgConnection, change: &RowChange) -> Result<(), RowError> {
        let descriptor = change.descriptor();
        let table = quote_ident(&descriptor.schema().table());
        let missing = || RowError::Missing {
            entity_type: descriptor.entity_type(),
            key: change.key().clone(),
        };
        match change {
            RowChange::Added { key, document, .. } => {
                let sql = format!("INSERT INTO {table} (id, body) VALUES ($1, $2)");
                bind_key(sqlx::query(&sql), key)
                    .bind(Json(document))
                    .execute(&mut *tx)
                    .await
                    .map_err(|error| {
                        if is_unique_violation(&error) {
                            RowError::Duplicate {
                                entity_type: descriptor.entity_type(),
                                key: key.clone(),
                            }
                        } else {
                            RowError::backend(error)
                        }
                    })?;
            }
            RowChange::Modified { key, document, .. } => {
                let sql = format!("UPDATE {table} SET body = $2 WHERE id = $1");
                let result = bind_key(sqlx::query(&sql), key)
                    .bind(Json(document))
                    .execute(&mut *tx)
                    .await
                    .map_err(RowError::backend)?;
                if result.rows_affected() == 0 {
                    return Err(missing());
                }
            }
            RowChange::Deleted { key, .. } => {
                let sql = format!("DELETE FROM {table} WHERE id = $1");
                let result = bind_key(sqlx::query(&sql), key)
                    .execute(&mut *tx)
                    .await
                    .map_err(RowError::backend)?;
                if result.rows_affected() == 0 {
                    return Err(missing());
                }
            }
        }
        Ok(())
    }
}

impl RowSession for PgRowSession {
    async fn find<'a>(
        &'a mut self,
        descriptor: &'a EntityDescriptor,
        key: &'a PrimaryKey,
    ) -> Result<Option<Document>, RowError> {
        ensure_table(&mut self.conn, &self.tables, descriptor).await?;
        let sql = format!(
            "SELECT body FROM {} WHERE id = $1",
            quote_ident(&descriptor.schema().table())
        );
        let body: Option<Json<Document>> = bind_key(sqlx::query(&sql), key)
            .fetch_optional(&mut *self.conn)
            .await
            .map_err(RowError::backend)?
            .map(|row| sqlx::Row::try_get(&row, "body"))
            .transpose()
            .map_err(RowError::backend)?;
        Ok(body.map(|body| body.0))
    }

    #[tracing::instrument(skip(self, changes), fields(changes_len = changes.len()))]
    async fn commit(mut self, changes: Vec<RowChange>) -> Result<(), RowError> {
        for change in &changes {
            ensure_table(&mut self.conn, &self.tables, change.descriptor()).await?;
        }
        let mut tx = self.conn.begin().await.map_err(RowError::backend)?;
        for change in &changes {
            Self::apply(&mut tx, change).await?;
        }
        tx.commit().await.map_err(RowError::backend)?;
        tracing::debug!("projection rows committed");
        Ok(())
    }
}
