//! Store contracts.
//!
//! [`ReadingStore`] is the read-only view the aggregation engine and the
//! upload services consume. [`StatusStore`] holds the small amount of
//! upload state that must outlive the process.

use time::OffsetDateTime;

use wxrelay_types::Reading;

use crate::error::Result;
use crate::models::UploadStatus;

/// Ordered, time-indexed sequence of calibrated readings.
///
/// Implementations must never expose a partially written reading to a
/// reader, even while another thread appends.
pub trait ReadingStore: Send + Sync {
    /// The reading whose timestamp is closest to `at`.
    ///
    /// When two readings are equally distant the earlier one wins.
    /// Returns `None` only when the store is empty.
    fn nearest(&self, at: OffsetDateTime) -> Result<Option<Reading>>;

    /// Readings with `start <= timestamp < stop`, oldest first.
    ///
    /// Calling again with the same bounds restarts the sequence.
    fn range(&self, start: OffsetDateTime, stop: OffsetDateTime) -> Result<Vec<Reading>>;

    /// The oldest stored reading.
    fn first(&self) -> Result<Option<Reading>>;

    /// The newest stored reading.
    fn latest(&self) -> Result<Option<Reading>>;
}

/// Durable per-destination upload state.
pub trait StatusStore: Send + Sync {
    /// Current status for `destination` (empty if never recorded).
    fn upload_status(&self, destination: &str) -> Result<UploadStatus>;

    /// Record that an attempt started at `started_at`.
    fn record_attempt(&self, destination: &str, started_at: OffsetDateTime) -> Result<()>;

    /// Move the watermark to `reading_at`. Never moves it backwards.
    fn advance_watermark(&self, destination: &str, reading_at: OffsetDateTime) -> Result<()>;

    /// Persist the identity token obtained by registration.
    fn set_identity(&self, destination: &str, identity: &str) -> Result<()>;
}

/// Pick the nearer of the readings either side of `at`, preferring the
/// earlier one on a tie.
pub(crate) fn pick_nearest(
    at: OffsetDateTime,
    before: Option<Reading>,
    after: Option<Reading>,
) -> Option<Reading> {
    match (before, after) {
        (Some(before), Some(after)) => {
            if after.timestamp - at < at - before.timestamp {
                Some(after)
            } else {
                Some(before)
            }
        }
        (before, after) => before.or(after),
    }
}
