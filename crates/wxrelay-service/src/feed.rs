//! New-reading watcher.
//!
//! The reading store is filled by a separate logger process. [`LiveFeed`]
//! polls it for a reading newer than the last one seen and broadcasts it
//! to subscribers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use wxrelay_store::ReadingStore;
use wxrelay_types::Reading;

/// Capacity of the broadcast channel. Slow subscribers lose the oldest
/// readings first.
const CHANNEL_CAPACITY: usize = 16;

/// Broadcasts readings as they appear in the store.
pub struct LiveFeed {
    store: Arc<dyn ReadingStore>,
    poll_interval: Duration,
    sender: broadcast::Sender<Reading>,
    last_seen: Mutex<Option<OffsetDateTime>>,
}

impl LiveFeed {
    pub fn new(store: Arc<dyn ReadingStore>, poll_interval: Duration) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            store,
            poll_interval,
            sender,
            last_seen: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Reading> {
        self.sender.subscribe()
    }

    /// Treat everything currently stored as already seen.
    pub fn prime(&self) -> wxrelay_store::Result<()> {
        let latest = self.store.latest()?.map(|r| r.timestamp);
        *self.last_seen.lock().map_err(|_| wxrelay_store::Error::LockPoisoned)? = latest;
        Ok(())
    }

    /// Check the store once. Returns the reading broadcast, if any.
    pub fn poll_once(&self) -> wxrelay_store::Result<Option<Reading>> {
        let Some(latest) = self.store.latest()? else {
            return Ok(None);
        };
        let mut last_seen = self
            .last_seen
            .lock()
            .map_err(|_| wxrelay_store::Error::LockPoisoned)?;
        if last_seen.is_some_and(|seen| latest.timestamp <= seen) {
            return Ok(None);
        }
        *last_seen = Some(latest.timestamp);

        if self.sender.send(latest.clone()).is_err() {
            debug!("No subscribers for live reading");
        }
        Ok(Some(latest))
    }

    /// Poll until `stop` turns true.
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        if let Err(e) = self.prime() {
            warn!("Failed to read latest reading: {}", e);
        }
        info!(poll_interval = ?self.poll_interval, "Watching for new readings");

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    match self.poll_once() {
                        Ok(Some(reading)) => debug!(reading = %reading.timestamp, "New reading"),
                        Ok(None) => {}
                        Err(e) => warn!("Failed to poll reading store: {}", e),
                    }
                }
            }
        }
        info!("Stopped watching for new readings");
    }
}
