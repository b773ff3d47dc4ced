use thiserror::Error;

/// Errors from [`LogStore`](crate::LogStore) reads and clears.
///
/// Conflicts and encoding failures on append are reported through
/// [`AppendError`](eventide_core::store::AppendError) instead.
#[derive(Debug, Error)]
pub enum Error<LogError>
where
    LogError: std::error::Error,
{
    /// The stream was deleted while it was being read.
    #[error("stream `{stream}` was deleted")]
    StreamDeleted { stream: String },
    #[error("event log error: {0}")]
    Log(#[source] LogError),
}
