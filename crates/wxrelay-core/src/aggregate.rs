//! Window statistics over a [`ReadingStore`].
//!
//! Every function here is a pure read of the store. Windows that align to
//! a calendar day use the station's local timezone; the boundary instant is
//! converted back to UTC before it is compared with stored timestamps.

use std::fmt;

use chrono::{LocalResult, TimeZone, Utc};
use chrono_tz::Tz;
use time::{Duration, OffsetDateTime};
use tracing::debug;

use wxrelay_store::ReadingStore;
use wxrelay_types::{Field, Reading};

use crate::error::{AggregateError, Result};

const DAY: Duration = Duration::hours(24);

/// The kind of window a [`Window`] value was computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowKind {
    /// Maximum over the trailing 24 hours.
    TrailingMax24h,
    /// Accumulation since the most recent local midnight.
    SinceLocalMidnight,
    /// Accumulation since the given number of hours ago.
    SinceHoursAgo(u32),
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowKind::TrailingMax24h => write!(f, "trailing-24h-max"),
            WindowKind::SinceLocalMidnight => write!(f, "since-local-midnight"),
            WindowKind::SinceHoursAgo(hours) => write!(f, "since-{hours}h-ago"),
        }
    }
}

/// A derived window statistic. Recomputed per request, never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub kind: WindowKind,
    /// The instant the window was evaluated at.
    pub reference: OffsetDateTime,
    pub value: f64,
}

/// Difference of the rain counter between two readings.
pub fn rain_delta(now: &Reading, then: &Reading) -> Option<f64> {
    Some(now.rain? - then.rain?)
}

fn ensure_history(
    store: &dyn ReadingStore,
    kind: WindowKind,
    at: OffsetDateTime,
) -> Result<()> {
    match store.first()? {
        Some(first) if first.timestamp <= at => Ok(()),
        _ => Err(AggregateError::InsufficientHistory { kind, at }),
    }
}

/// Maximum of `field` over the 24 hours ending at `at`.
///
/// The scan starts at the reading nearest `at - 24h` and is seeded with the
/// reading at `at`, so the result never misses a reading inside the window.
pub fn trailing_max(store: &dyn ReadingStore, field: Field, at: OffsetDateTime) -> Result<Window> {
    let kind = WindowKind::TrailingMax24h;
    ensure_history(store, kind, at)?;

    let window_start = at - DAY;
    let start = store
        .nearest(window_start)?
        .map_or(window_start, |r| r.timestamp.min(window_start));

    let mut max = store
        .nearest(at)?
        .filter(|r| r.timestamp <= at)
        .and_then(|r| r.get(field));

    for reading in store.range(start, at)? {
        if let Some(value) = reading.get(field).filter(|v| !v.is_nan()) {
            max = Some(max.map_or(value, |m: f64| m.max(value)));
        }
    }

    max.map(|value| Window {
        kind,
        reference: at,
        value,
    })
    .ok_or(AggregateError::MissingValue { kind, at })
}

/// Accumulated `delta` between the reading at `at` and the reading nearest
/// `hours` earlier, clamped to be non-negative.
pub fn since_hours_ago<F>(
    store: &dyn ReadingStore,
    delta: F,
    at: OffsetDateTime,
    hours: u32,
) -> Result<Window>
where
    F: Fn(&Reading, &Reading) -> Option<f64>,
{
    let kind = WindowKind::SinceHoursAgo(hours);
    ensure_history(store, kind, at)?;

    let current = store
        .nearest(at)?
        .ok_or(AggregateError::InsufficientHistory { kind, at })?;
    let reference = store
        .nearest(at - Duration::hours(i64::from(hours)))?
        .ok_or(AggregateError::InsufficientHistory { kind, at })?;

    accumulate(kind, at, &delta, &current, &reference)
}

fn accumulate<F>(
    kind: WindowKind,
    at: OffsetDateTime,
    delta: &F,
    current: &Reading,
    reference: &Reading,
) -> Result<Window>
where
    F: Fn(&Reading, &Reading) -> Option<f64>,
{
    let value = delta(current, reference)
        .filter(|v| !v.is_nan())
        .ok_or(AggregateError::MissingValue { kind, at })?;

    Ok(Window {
        kind,
        reference: at,
        // A counter reset shows up as a decrease: no rain, not negative rain.
        value: value.max(0.0),
    })
}

/// The instant of local midnight, in timezone `tz`, that starts the local
/// calendar day containing `at`.
///
/// When a DST transition skips midnight the day starts at the first valid
/// local time after it. An ambiguous midnight resolves to the earlier
/// instant.
pub fn local_midnight(at: OffsetDateTime, tz: Tz) -> Result<OffsetDateTime> {
    let invalid = || AggregateError::InvalidTime(at);

    let local = Utc
        .timestamp_opt(at.unix_timestamp(), 0)
        .single()
        .ok_or_else(invalid)?
        .with_timezone(&tz);
    let naive = local.date_naive().and_hms_opt(0, 0, 0).ok_or_else(invalid)?;

    let midnight = match tz.from_local_datetime(&naive) {
        LocalResult::Single(t) => t,
        LocalResult::Ambiguous(earliest, _) => earliest,
        LocalResult::None => tz
            .from_local_datetime(&(naive + chrono::TimeDelta::hours(1)))
            .earliest()
            .ok_or_else(invalid)?,
    };

    OffsetDateTime::from_unix_timestamp(midnight.timestamp()).map_err(|_| invalid())
}

/// Caches the local-midnight reference reading between calls.
///
/// The reference is re-fetched only when `at` falls on a different local
/// calendar day from the previous call. Midnight is computed directly from
/// `at`, so a clock that jumps by days or years costs one recompute, not a
/// walk across every day in between.
#[derive(Debug)]
pub struct MidnightTracker {
    tz: Tz,
    cached: Option<(OffsetDateTime, Reading)>,
    recomputes: u64,
}

impl MidnightTracker {
    pub fn new(tz: Tz) -> Self {
        Self {
            tz,
            cached: None,
            recomputes: 0,
        }
    }

    /// The timezone days are aligned to.
    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// How many times the midnight reference has been recomputed.
    pub fn recompute_count(&self) -> u64 {
        self.recomputes
    }

    /// Accumulated `delta` since local midnight, clamped to be non-negative.
    pub fn since_local_midnight<F>(
        &mut self,
        store: &dyn ReadingStore,
        delta: F,
        at: OffsetDateTime,
    ) -> Result<Window>
    where
        F: Fn(&Reading, &Reading) -> Option<f64>,
    {
        let kind = WindowKind::SinceLocalMidnight;
        ensure_history(store, kind, at)?;

        let midnight = local_midnight(at, self.tz)?;
        let reference = match &self.cached {
            Some((cached, reading)) if *cached == midnight => reading.clone(),
            _ => {
                let reading = store
                    .nearest(midnight)?
                    .ok_or(AggregateError::InsufficientHistory { kind, at })?;
                debug!(%midnight, reference = %reading.timestamp, "Recomputed local midnight");
                self.recomputes += 1;
                self.cached = Some((midnight, reading.clone()));
                reading
            }
        };

        let current = store
            .nearest(at)?
            .ok_or(AggregateError::InsufficientHistory { kind, at })?;

        accumulate(kind, at, &delta, &current, &reference)
    }
}

/// One-shot [`MidnightTracker::since_local_midnight`] without caching.
pub fn since_local_midnight<F>(
    store: &dyn ReadingStore,
    delta: F,
    at: OffsetDateTime,
    tz: Tz,
) -> Result<Window>
where
    F: Fn(&Reading, &Reading) -> Option<f64>,
{
    MidnightTracker::new(tz).since_local_midnight(store, delta, at)
}
