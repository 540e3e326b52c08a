//! Data models for stored upload state.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Durable per-destination upload state.
///
/// This is the only state outside the reading store that survives a
/// restart: the throttle needs the last attempt start, catch-up needs the
/// watermark, and registered destinations need their identity token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStatus {
    /// Destination identifier from configuration.
    pub destination: String,
    /// When the most recent attempt started, whatever its outcome.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt_at: Option<OffsetDateTime>,
    /// Timestamp of the newest reading successfully uploaded.
    #[serde(with = "time::serde::rfc3339::option")]
    pub watermark: Option<OffsetDateTime>,
    /// Remote identity token obtained by registration.
    pub identity: Option<String>,
}

impl UploadStatus {
    /// Empty status for a destination that has never uploaded.
    pub fn new(destination: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            ..Default::default()
        }
    }
}
