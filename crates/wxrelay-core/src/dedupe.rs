//! Minimum-interval thinning of reading sequences.

use time::{Duration, OffsetDateTime};

use wxrelay_store::ReadingStore;
use wxrelay_types::Reading;

/// Iterator adapter that drops readings closer than `min_interval` to the
/// previously emitted one.
///
/// The first reading is always emitted. Skipped readings are discarded, not
/// merged into their neighbours.
#[derive(Debug, Clone)]
pub struct DedupeByInterval<I> {
    inner: I,
    min_interval: Duration,
    last: Option<OffsetDateTime>,
}

impl<I> DedupeByInterval<I> {
    pub fn new(inner: I, min_interval: Duration) -> Self {
        Self {
            inner,
            min_interval,
            last: None,
        }
    }
}

impl<I> Iterator for DedupeByInterval<I>
where
    I: Iterator<Item = Reading>,
{
    type Item = Reading;

    fn next(&mut self) -> Option<Reading> {
        loop {
            let reading = self.inner.next()?;
            let keep = self
                .last
                .is_none_or(|last| reading.timestamp - last >= self.min_interval);
            if keep {
                self.last = Some(reading.timestamp);
                return Some(reading);
            }
        }
    }
}

/// Extension trait adding [`DedupeByInterval`] to reading iterators.
pub trait DedupeExt: Iterator<Item = Reading> + Sized {
    fn dedupe_by_interval(self, min_interval: Duration) -> DedupeByInterval<Self> {
        DedupeByInterval::new(self, min_interval)
    }
}

impl<I: Iterator<Item = Reading>> DedupeExt for I {}

/// Readings in `[start, stop)` thinned to at least `min_interval` apart.
///
/// Calling again with the same arguments restarts from the first reading.
pub fn dedupe_by_interval(
    store: &dyn ReadingStore,
    start: OffsetDateTime,
    stop: OffsetDateTime,
    min_interval: Duration,
) -> wxrelay_store::Result<DedupeByInterval<std::vec::IntoIter<Reading>>> {
    Ok(store.range(start, stop)?.into_iter().dedupe_by_interval(min_interval))
}
