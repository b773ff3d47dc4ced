//! Stream version arithmetic.
//!
//! The public API numbers events from 1: the first event of a stream is
//! version 1 and an empty (or missing) stream is at version 0. Backends use
//! their own numbering, so every adapter funnels its translation through these
//! helpers instead of doing ad-hoc `+ 1`/`- 1` arithmetic.

/// Version of a stream that has never been written.
pub const NO_STREAM: u64 = 0;

/// Translate a public 1-based version to a 0-based native revision.
///
/// Returns `None` for version 0, which has no native counterpart.
#[must_use]
pub const fn to_zero_based(version: u64) -> Option<u64> {
    version.checked_sub(1)
}

/// Translate a 0-based native revision to the public 1-based version.
#[must_use]
pub const fn from_zero_based(revision: u64) -> u64 {
    revision + 1
}

/// Clamp a partial-read start so that versions before the first event read
/// from the stream start.
#[must_use]
pub const fn clamp_from_version(from_version: u64) -> u64 {
    if from_version == NO_STREAM {
        1
    } else {
        from_version
    }
}

/// Stream version after appending `count` events at `expected_version`.
///
/// Backends that check "expected version after append" are handed this value
/// rather than the caller's expected version. `None` when the result does not
/// fit, which no real stream can reach.
#[must_use]
pub fn expected_after_append(expected_version: u64, count: usize) -> Option<u64> {
    expected_version.checked_add(u64::try_from(count).ok()?)
}
