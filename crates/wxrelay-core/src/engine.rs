//! The derived-value bundle consumed by field templates.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono_tz::Tz;
use time::OffsetDateTime;
use tracing::debug;

use wxrelay_store::ReadingStore;
use wxrelay_types::{Field, Reading, convert};

use crate::aggregate::{self, MidnightTracker, Window, rain_delta};
use crate::error::Result;

/// A derived metric a template can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Rain over the last hour (mm).
    RainHour,
    /// Rain over the last 24 hours (mm).
    Rain24h,
    /// Rain since local midnight (mm).
    RainDay,
    /// Maximum outdoor temperature over the last 24 hours (°C).
    MaxTemp24h,
    /// Dew point (°C).
    DewPoint,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Metric::RainHour => "rain_hour",
            Metric::Rain24h => "rain_24h",
            Metric::RainDay => "rain_day",
            Metric::MaxTemp24h => "max_temp_24h",
            Metric::DewPoint => "dew_point",
        };
        f.write_str(name)
    }
}

/// Derived values for one reading. A metric that could not be computed is
/// `None`; the template renders its sentinel.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DerivedValues {
    pub rain_hour: Option<f64>,
    pub rain_24h: Option<f64>,
    pub rain_day: Option<f64>,
    pub max_temp_24h: Option<f64>,
    pub dew_point: Option<f64>,
}

impl DerivedValues {
    pub fn get(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::RainHour => self.rain_hour,
            Metric::Rain24h => self.rain_24h,
            Metric::RainDay => self.rain_day,
            Metric::MaxTemp24h => self.max_temp_24h,
            Metric::DewPoint => self.dew_point,
        }
    }
}

/// Computes window statistics against a shared store.
///
/// Holds the station timezone and the midnight cache, so one engine
/// should be shared by everything deriving values for the same station.
pub struct AggregationEngine {
    store: Arc<dyn ReadingStore>,
    midnight: Mutex<MidnightTracker>,
}

impl AggregationEngine {
    pub fn new(store: Arc<dyn ReadingStore>, tz: Tz) -> Self {
        Self {
            store,
            midnight: Mutex::new(MidnightTracker::new(tz)),
        }
    }

    pub fn store(&self) -> &Arc<dyn ReadingStore> {
        &self.store
    }

    pub fn timezone(&self) -> Tz {
        self.tracker().timezone()
    }

    fn tracker(&self) -> std::sync::MutexGuard<'_, MidnightTracker> {
        // The tracker is a cache; a panic mid-update leaves it usable.
        self.midnight.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn trailing_max(&self, field: Field, at: OffsetDateTime) -> Result<Window> {
        aggregate::trailing_max(self.store.as_ref(), field, at)
    }

    pub fn rain_since_hours_ago(&self, at: OffsetDateTime, hours: u32) -> Result<Window> {
        aggregate::since_hours_ago(self.store.as_ref(), rain_delta, at, hours)
    }

    pub fn rain_since_midnight(&self, at: OffsetDateTime) -> Result<Window> {
        self.tracker()
            .since_local_midnight(self.store.as_ref(), rain_delta, at)
    }

    /// Compute every [`Metric`] for `reading`.
    ///
    /// Each metric fails independently; a failure is logged and leaves
    /// only that metric empty.
    pub fn derive(&self, reading: &Reading) -> DerivedValues {
        let at = reading.timestamp;
        DerivedValues {
            rain_hour: settle(Metric::RainHour, self.rain_since_hours_ago(at, 1)),
            rain_24h: settle(Metric::Rain24h, self.rain_since_hours_ago(at, 24)),
            rain_day: settle(Metric::RainDay, self.rain_since_midnight(at)),
            max_temp_24h: settle(Metric::MaxTemp24h, self.trailing_max(Field::TempOut, at)),
            dew_point: reading
                .temp_out
                .zip(reading.hum_out)
                .and_then(|(t, h)| convert::dew_point(t, f64::from(h))),
        }
    }
}

fn settle(metric: Metric, result: Result<Window>) -> Option<f64> {
    match result {
        Ok(window) => Some(window.value),
        Err(e) => {
            debug!(%metric, error = %e, "Derived metric unavailable");
            None
        }
    }
}
