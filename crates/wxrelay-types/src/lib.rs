//! Shared types for weather station telemetry.
//!
//! This crate provides the reading model used by the store, the
//! aggregation engine and the upload services, plus the pure unit
//! conversions those components apply.
//!
//! # Features
//!
//! - [`Reading`]: one timestamped, calibrated station sample
//! - [`Field`]: named numeric fields for generic lookups
//! - [`HardwareClass`]: station variants and the optional sensors they carry
//! - [`convert`]: stateless unit conversions
//!
//! # Example
//!
//! ```
//! use time::OffsetDateTime;
//! use wxrelay_types::{Field, Reading};
//!
//! let reading = Reading::new(OffsetDateTime::UNIX_EPOCH).with(Field::TempOut, 12.5);
//! assert_eq!(reading.get(Field::TempOut), Some(12.5));
//! ```

pub mod convert;
pub mod error;
pub mod types;

pub use error::{ParseError, ParseResult};
pub use types::{Field, HardwareClass, Reading};
