//! Injectable time source.
//!
//! Throttling and catch-up pacing read the time through [`Clock`] so tests
//! can drive them with a [`ManualClock`].

use std::fmt::Debug;
use std::sync::Mutex;

use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

#[async_trait]
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> OffsetDateTime;

    /// Wait until `deadline`. Returns at once if it has passed.
    async fn sleep_until(&self, deadline: OffsetDateTime);
}

/// Wall clock backed by tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    async fn sleep_until(&self, deadline: OffsetDateTime) {
        let remaining = deadline - self.now();
        if let Ok(remaining) = std::time::Duration::try_from(remaining) {
            tokio::time::sleep(remaining).await;
        }
    }
}

/// Clock that only moves when told to.
///
/// `sleep_until` jumps the clock forward to the deadline and records it.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
    sleeps: Mutex<Vec<OffsetDateTime>>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }

    /// Deadlines passed to `sleep_until`, in call order.
    pub fn sleeps(&self) -> Vec<OffsetDateTime> {
        self.sleeps.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn sleep_until(&self, deadline: OffsetDateTime) {
        self.sleeps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(deadline);
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        if *now < deadline {
            *now = deadline;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn test_manual_clock_jumps_on_sleep() {
        let clock = ManualClock::new(datetime!(2024-01-01 00:00 UTC));
        clock.sleep_until(datetime!(2024-01-01 00:05 UTC)).await;
        assert_eq!(clock.now(), datetime!(2024-01-01 00:05 UTC));

        // Sleeping into the past does not rewind
        clock.sleep_until(datetime!(2024-01-01 00:01 UTC)).await;
        assert_eq!(clock.now(), datetime!(2024-01-01 00:05 UTC));
        assert_eq!(clock.sleeps().len(), 2);

        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now(), datetime!(2024-01-01 00:05:30 UTC));
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_clock_past_deadline_returns() {
        let clock = SystemClock;
        clock.sleep_until(clock.now() - Duration::minutes(1)).await;
    }
}
