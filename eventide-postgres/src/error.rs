use crate::settings::SettingsError;

/// Error type for `PostgreSQL` event store and row store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Query execution or transaction failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The working database could not be created.
    #[error("failed to create database `{database}`: {source}")]
    Bootstrap {
        database: String,
        #[source]
        source: sqlx::Error,
    },
    #[error(transparent)]
    Settings(#[from] SettingsError),
    /// A version column held a value outside the public range.
    #[error("invalid version value from database: {0}")]
    InvalidVersion(i64),
    /// A caller-supplied version does not fit the version column.
    #[error("version {0} does not fit the version column")]
    VersionOutOfRange(u64),
    /// A chain of links did not end at a domain event.
    #[error("link chain from `{stream}` is too deep")]
    LinkDepthExceeded { stream: String },
}

/// `SQLSTATE`s raised by concurrent `CREATE` statements racing each other.
const CONCURRENT_CREATE_CODES: [&str; 3] = [
    // duplicate_database
    "42P04",
    // duplicate_table
    "42P07",
    // unique_violation (on the system catalogs)
    "23505",
];

pub(crate) const UNIQUE_VIOLATION: &str = "23505";

pub(crate) fn sqlstate(error: &sqlx::Error) -> Option<String> {
    error
        .as_database_error()
        .and_then(|db| db.code())
        .map(std::borrow::Cow::into_owned)
}

/// Whether `error` only means another process created the object first.
pub(crate) fn is_concurrent_create(error: &sqlx::Error) -> bool {
    sqlstate(error).is_some_and(|code| CONCURRENT_CREATE_CODES.contains(&code.as_str()))
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    sqlstate(error).is_some_and(|code| code == UNIQUE_VIOLATION)
}

pub(crate) fn to_db_version(version: u64) -> Result<i64, Error> {
    i64::try_from(version).map_err(|_| Error::VersionOutOfRange(version))
}

pub(crate) fn from_db_version(version: i64) -> Result<u64, Error> {
    u64::try_from(version).map_err(|_| Error::InvalidVersion(version))
}

/// Quote an identifier for interpolation into DDL or DML.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
