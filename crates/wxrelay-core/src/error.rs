//! Error types for wxrelay-core.
//!
//! Aggregation failures are scoped to a single derived metric: callers such
//! as [`crate::AggregationEngine::derive`] turn them into a missing value so
//! the template substitutes a sentinel and the rest of the upload proceeds.

use thiserror::Error;
use time::OffsetDateTime;

use crate::aggregate::WindowKind;

/// Result type for aggregation queries.
pub type Result<T> = std::result::Result<T, AggregateError>;

/// Errors raised while computing a window statistic.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AggregateError {
    /// The store holds no readings covering the requested instant.
    #[error("Insufficient history for {kind} window at {at}")]
    InsufficientHistory { kind: WindowKind, at: OffsetDateTime },

    /// Readings exist but none carries the requested value.
    #[error("No value available for {kind} window at {at}")]
    MissingValue { kind: WindowKind, at: OffsetDateTime },

    /// The instant cannot be placed on the station's local calendar.
    #[error("Cannot resolve local midnight for {0}")]
    InvalidTime(OffsetDateTime),

    /// The reading store failed.
    #[error("Store error: {0}")]
    Store(#[from] wxrelay_store::Error),
}

/// Errors raised by the bulk report export.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Writing a CSV record failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Reading the store failed.
    #[error("Store error: {0}")]
    Store(#[from] wxrelay_store::Error),

    /// Flushing the output failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
