//! Windowed aggregation and field templating for wxrelay.
//!
//! This crate turns stored readings into the values upload destinations
//! need:
//!
//! - [`aggregate`]: trailing 24 h maxima and rain accumulated since local
//!   midnight or since N hours ago, computed against a [`ReadingStore`]
//! - [`AggregationEngine`]: bundles those windows into [`DerivedValues`]
//!   for one reading, degrading per metric
//! - [`dedupe`]: minimum-interval thinning of reading sequences
//! - [`template`]: the [`FieldSpec`] table interpreter that renders a
//!   reading into fixed-width or request fields
//! - [`export`]: bulk CSV report export
//!
//! [`ReadingStore`]: wxrelay_store::ReadingStore
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use time::macros::datetime;
//! use wxrelay_core::{AggregationEngine, Tz};
//! use wxrelay_store::MemoryStore;
//! use wxrelay_types::{Field, Reading};
//!
//! let store = MemoryStore::new();
//! store.insert(Reading::new(datetime!(2024-01-01 00:00 UTC)).with(Field::Rain, 10.0))?;
//! store.insert(Reading::new(datetime!(2024-01-01 06:00 UTC)).with(Field::Rain, 12.5))?;
//!
//! let engine = AggregationEngine::new(Arc::new(store), Tz::UTC);
//! let window = engine.rain_since_midnight(datetime!(2024-01-01 06:00 UTC))?;
//! assert_eq!(window.value, 2.5);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod aggregate;
pub mod dedupe;
pub mod engine;
pub mod error;
pub mod export;
pub mod template;

pub use aggregate::{
    MidnightTracker, Window, WindowKind, local_midnight, rain_delta, since_hours_ago,
    since_local_midnight, trailing_max,
};
pub use dedupe::{DedupeByInterval, DedupeExt, dedupe_by_interval};
pub use engine::{AggregationEngine, DerivedValues, Metric};
pub use error::{AggregateError, ExportError, Result};
pub use export::export_bulk;
pub use template::{
    FieldSpec, FieldTemplate, Format, Predicate, Resolved, Selector, TemplateContext, TimeFormat,
    Transform, Validity, Value,
};

/// Re-exported so callers name timezones without a direct dependency.
pub use chrono_tz::Tz;
