//! Fan-out of readings to destinations.
//!
//! New live readings go to every destination's live path at once. A timer
//! whose period is the shortest interval among logged destinations drives
//! catch-up. Each event runs in its own task so a slow destination never
//! holds up another; per-destination exclusion lives in the upload service.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use wxrelay_types::Reading;

use crate::upload::{Mode, UploadAttempt, Uploader};

/// Schedules every configured destination.
pub struct Dispatcher {
    destinations: Vec<Arc<dyn Uploader>>,
    /// One flag per destination, set while its catch-up pass runs.
    catching_up: Vec<AtomicBool>,
}

/// Clears a destination's catch-up flag when the pass ends, even on panic.
struct CatchUpGuard<'a>(&'a AtomicBool);

impl Drop for CatchUpGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<_> = self.destinations.iter().map(|d| d.id()).collect();
        f.debug_struct("Dispatcher").field("destinations", &ids).finish()
    }
}

impl Dispatcher {
    pub fn new(destinations: Vec<Arc<dyn Uploader>>) -> Self {
        let catching_up = destinations.iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            destinations,
            catching_up,
        }
    }

    pub fn destinations(&self) -> &[Arc<dyn Uploader>] {
        &self.destinations
    }

    /// Shortest interval among destinations with the logged path enabled.
    pub fn tick_period(&self) -> Option<Duration> {
        self.destinations
            .iter()
            .filter(|d| d.has_mode(Mode::Logged))
            .map(|d| d.interval())
            .min()
    }

    /// Offer a new reading to every destination's live path.
    ///
    /// Returns the attempts that were made; throttled or busy destinations
    /// are skipped.
    pub async fn on_live_reading(&self, reading: &Reading) -> Vec<UploadAttempt> {
        let attempts = join_all(
            self.destinations
                .iter()
                .filter(|d| d.has_mode(Mode::Live))
                .map(|d| d.upload_live(reading)),
        )
        .await;
        attempts.into_iter().flatten().collect()
    }

    /// Run one catch-up pass over every logged destination.
    ///
    /// A destination whose previous pass is still running is skipped; the
    /// others proceed.
    pub async fn tick(&self) -> Vec<UploadAttempt> {
        let passes = self
            .destinations
            .iter()
            .zip(&self.catching_up)
            .filter(|(d, _)| d.has_mode(Mode::Logged))
            .filter_map(|(d, flag)| {
                if flag.swap(true, Ordering::AcqRel) {
                    debug!(destination = d.id(), "Catch-up still running, skipping tick");
                    return None;
                }
                Some(async move {
                    let _guard = CatchUpGuard(flag);
                    d.catch_up().await
                })
            });
        join_all(passes).await.into_iter().flatten().collect()
    }

    /// Dispatch until `stop` turns true or the reading feed closes.
    ///
    /// In-flight attempts are awaited before returning.
    pub async fn run(
        self: Arc<Self>,
        mut readings: broadcast::Receiver<Reading>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut ticker = self
            .tick_period()
            .and_then(|p| std::time::Duration::try_from(p).ok())
            .map(|period| {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                interval
            });
        info!(
            destinations = self.destinations.len(),
            tick = ?self.tick_period(),
            "Dispatcher started"
        );

        let mut tasks = JoinSet::new();
        loop {
            tokio::select! {
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                received = readings.recv() => match received {
                    Ok(reading) => {
                        debug!(reading = %reading.timestamp, "New live reading");
                        let dispatcher = Arc::clone(&self);
                        tasks.spawn(async move {
                            dispatcher.on_live_reading(&reading).await;
                        });
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Dispatcher lagged, {} live readings superseded", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = next_tick(&mut ticker) => {
                    let dispatcher = Arc::clone(&self);
                    tasks.spawn(async move {
                        dispatcher.tick().await;
                    });
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!("Dispatch task failed: {}", e);
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "Dispatcher stopping");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Dispatch task failed: {}", e);
            }
        }
        info!("Dispatcher stopped");
    }
}

async fn next_tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::mock::MockProtocol;
    use crate::upload::{UploadService, UploadSettings};
    use time::OffsetDateTime;
    use time::macros::datetime;
    use wxrelay_core::{AggregationEngine, Tz};
    use wxrelay_store::{MemoryStatusStore, MemoryStore};

    const START: OffsetDateTime = datetime!(2024-05-01 12:00 UTC);

    fn service(
        id: &str,
        interval: i64,
        live: bool,
        logged: bool,
        clock: Arc<ManualClock>,
    ) -> Arc<UploadService<MockProtocol>> {
        let store = MemoryStore::from_readings((0..10).map(|m| Reading::new(START + Duration::minutes(m))));
        let engine = Arc::new(AggregationEngine::new(Arc::new(store), Tz::UTC));
        Arc::new(UploadService::new(
            id,
            MockProtocol::new(),
            engine,
            Arc::new(MemoryStatusStore::new()),
            clock,
            UploadSettings {
                interval: Duration::seconds(interval),
                catchup: 3,
                timeout: std::time::Duration::from_secs(20),
                live,
                logged,
            },
        ))
    }

    fn uploaders(services: &[&Arc<UploadService<MockProtocol>>]) -> Vec<Arc<dyn Uploader>> {
        services
            .iter()
            .map(|s| Arc::clone(*s) as Arc<dyn Uploader>)
            .collect()
    }

    #[test]
    fn test_tick_period_is_shortest_logged_interval() {
        let clock = Arc::new(ManualClock::new(START));
        let a = service("a", 290, true, false, clock.clone());
        let b = service("b", 40, true, true, clock.clone());
        let c = service("c", 120, false, true, clock);
        let dispatcher = Dispatcher::new(uploaders(&[&a, &b, &c]));
        assert_eq!(dispatcher.tick_period(), Some(Duration::seconds(40)));

        let live_only = Dispatcher::new(uploaders(&[&a]));
        assert_eq!(live_only.tick_period(), None);
    }

    #[tokio::test]
    async fn test_live_reading_reaches_live_destinations_only() {
        let clock = Arc::new(ManualClock::new(START + Duration::hours(1)));
        let live = service("live", 60, true, false, clock.clone());
        let logged = service("logged", 60, false, true, clock.clone());
        let dispatcher = Dispatcher::new(uploaders(&[&live, &logged]));

        let attempts = dispatcher
            .on_live_reading(&Reading::new(START + Duration::minutes(9)))
            .await;
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].destination, "live");
        assert_eq!(logged.protocol().opened_sessions(), 0);
    }

    #[tokio::test]
    async fn test_tick_runs_catch_up() {
        let clock = Arc::new(ManualClock::new(START + Duration::hours(1)));
        let logged = service("logged", 60, false, true, clock);
        let dispatcher = Dispatcher::new(uploaders(&[&logged]));

        let attempts = dispatcher.tick().await;
        assert_eq!(attempts.len(), 3);
        assert!(dispatcher.tick().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let clock = Arc::new(ManualClock::new(START + Duration::hours(1)));
        let live = service("live", 60, true, false, clock);
        let dispatcher = Arc::new(Dispatcher::new(uploaders(&[&live])));

        let (tx, rx) = broadcast::channel(4);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(dispatcher.run(rx, stop_rx));

        tx.send(Reading::new(START + Duration::minutes(9))).unwrap();
        // Let the dispatcher pick the reading up before stopping
        while live.protocol().closed_sessions() == 0 {
            tokio::task::yield_now().await;
        }
        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(live.protocol().sent().len(), 1);
    }
}
