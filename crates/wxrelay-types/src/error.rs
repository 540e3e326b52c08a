//! Error types for data parsing in wxrelay-types.

use thiserror::Error;

/// Errors that can occur when parsing reading-related identifiers.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ParseError {
    /// The name does not match any reading field.
    #[error("Unknown reading field: {0}")]
    UnknownField(String),

    /// The name does not match any station hardware class.
    #[error("Unknown hardware class: {0}")]
    UnknownHardware(String),

    /// A value is outside the range the type can represent.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using wxrelay-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;
