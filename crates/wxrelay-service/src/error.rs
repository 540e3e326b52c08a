//! Upload error types and their failure classification.
//!
//! | Error | Kind | Notes |
//! |-------|------|-------|
//! | [`UploadError::Io`] | Retryable | Connection refused, reset, DNS failure |
//! | [`UploadError::Timeout`] | Retryable | Any network step exceeding its limit |
//! | [`UploadError::Http`] | Depends | Connect/timeout retryable, decode permanent |
//! | [`UploadError::Status`] | Depends | 5xx retryable, anything else permanent |
//! | [`UploadError::AuthRejected`] | Permanent | Bad credentials |
//! | [`UploadError::Malformed`] | Permanent | Unexpected server response |
//! | [`UploadError::MissingIdentity`] | Permanent | Destination not registered |
//! | [`UploadError::Store`] | Retryable | Local status store failure |
//!
//! A permanent failure ends that attempt only. The destination is tried
//! again at its next interval.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::upload::AttemptState;

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// Transient: the same reading may succeed at the next opportunity.
    Retryable,
    /// Rejected by the destination for this attempt.
    Permanent,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Retryable => write!(f, "retryable"),
            FailureKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Errors raised by an upload attempt or a registration.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UploadError {
    /// Transport-level I/O failure.
    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),

    /// A network step did not finish in time.
    #[error("Timed out after {after:?} during {stage}")]
    Timeout { stage: AttemptState, after: Duration },

    /// HTTP client failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The destination answered with a non-success HTTP status.
    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    /// The destination refused our credentials.
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// The destination sent something we could not interpret.
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// The destination requires registration before uploading.
    #[error("Destination has no registered identity")]
    MissingIdentity,

    /// The destination does not support registration.
    #[error("Registration is not supported by {0}")]
    RegistrationUnsupported(&'static str),

    /// The durable status store failed.
    #[error("Status store error: {0}")]
    Store(#[from] wxrelay_store::Error),
}

impl UploadError {
    /// Classify this error as retryable or permanent.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            UploadError::Io(_) | UploadError::Timeout { .. } | UploadError::Store(_) => {
                FailureKind::Retryable
            }
            UploadError::Http(e) => {
                if e.is_timeout() || e.is_connect() || e.is_request() {
                    FailureKind::Retryable
                } else if let Some(status) = e.status() {
                    status_kind(status.as_u16())
                } else {
                    FailureKind::Permanent
                }
            }
            UploadError::Status { status, .. } => status_kind(*status),
            UploadError::AuthRejected(_)
            | UploadError::Malformed(_)
            | UploadError::MissingIdentity
            | UploadError::RegistrationUnsupported(_) => FailureKind::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Retryable
    }
}

fn status_kind(status: u16) -> FailureKind {
    if status >= 500 || status == 429 {
        FailureKind::Retryable
    } else {
        FailureKind::Permanent
    }
}
