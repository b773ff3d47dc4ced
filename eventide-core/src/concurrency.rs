//! Optimistic concurrency conflicts.
//!
//! Every adapter reports a stale or future `expected_version` with the same
//! [`WrongExpectedVersion`] error so callers stay backend-agnostic. The
//! conflict is terminal for the call: nothing in this workspace retries it.

use thiserror::Error;

/// Error indicating the stream was not at the version the writer expected.
///
/// Signals a duplicate or concurrent writer. The owning collaborator must
/// re-derive its state before writing again; retrying with the same expected
/// version will fail the same way.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(.stream, *.expected, *.actual))]
pub struct WrongExpectedVersion {
    /// Stream the append targeted.
    pub stream: String,
    /// The version the writer believed the stream to be at (0 = no stream).
    pub expected: u64,
    /// The version the backend reported, when it reports one.
    pub actual: Option<u64>,
}

impl WrongExpectedVersion {
    #[must_use]
    pub fn new(stream: impl Into<String>, expected: u64, actual: Option<u64>) -> Self {
        Self {
            stream: stream.into(),
            expected,
            actual,
        }
    }
}

fn format_conflict(stream: &str, expected: u64, actual: Option<u64>) -> String {
    match (expected, actual) {
        (0, Some(actual)) => format!(
            "wrong expected version for `{stream}`: expected new stream, found version {actual} \
             (hint: another writer created this stream; reload and retry)"
        ),
        (expected, Some(actual)) => format!(
            "wrong expected version for `{stream}`: expected {expected}, found {actual} (hint: \
             stream was modified; reload and retry)"
        ),
        (expected, None) => format!(
            "wrong expected version for `{stream}`: expected {expected}, backend did not report \
             the current version"
        ),
    }
}
