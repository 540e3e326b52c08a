//! Dispatcher scenarios with a mock protocol and a manual clock.

use std::sync::Arc;

use time::macros::datetime;
use time::{Duration, OffsetDateTime};

use wxrelay_core::{AggregationEngine, Tz};
use wxrelay_service::mock::{MockFailure, MockProtocol};
use wxrelay_service::{
    Clock, Dispatcher, ManualClock, Outcome, UploadService, UploadSettings, Uploader,
};
use wxrelay_store::{MemoryStatusStore, MemoryStore, StatusStore, Store};
use wxrelay_types::{Field, Reading};

const START: OffsetDateTime = datetime!(2024-05-01 00:00 UTC);

fn settings(interval: i64, catchup: usize, live: bool, logged: bool) -> UploadSettings {
    UploadSettings {
        interval: Duration::seconds(interval),
        catchup,
        timeout: std::time::Duration::from_secs(20),
        live,
        logged,
    }
}

/// Readings every five minutes for `hours` hours.
fn five_minutely(hours: i64) -> Arc<MemoryStore> {
    Arc::new(MemoryStore::from_readings((0..hours * 12).map(|i| {
        Reading::new(START + Duration::minutes(5 * i))
            .with(Field::TempOut, 10.0 + (i % 12) as f64)
            .with(Field::Rain, 0.3 * i as f64)
    })))
}

#[tokio::test]
async fn live_throttle_allows_one_attempt_per_interval() {
    let store = five_minutely(1);
    let clock = Arc::new(ManualClock::new(START + Duration::hours(1)));
    let cwop_like = Arc::new(UploadService::new(
        "cwop",
        MockProtocol::new(),
        Arc::new(AggregationEngine::new(store, Tz::UTC)),
        Arc::new(MemoryStatusStore::new()),
        clock.clone(),
        settings(290, 0, true, false),
    ));
    let dispatcher = Dispatcher::new(vec![cwop_like.clone() as Arc<dyn Uploader>]);

    let first = Reading::new(START + Duration::minutes(60));
    assert_eq!(dispatcher.on_live_reading(&first).await.len(), 1);

    clock.advance(Duration::seconds(60));
    let second = Reading::new(START + Duration::minutes(61));
    assert!(dispatcher.on_live_reading(&second).await.is_empty());

    assert_eq!(cwop_like.protocol().opened_sessions(), 1);
}

#[tokio::test]
async fn catch_up_after_outage_is_bounded() {
    // A day of readings, none uploaded
    let store = five_minutely(24);
    let clock = Arc::new(ManualClock::new(START + Duration::hours(24)));
    let status = Arc::new(MemoryStatusStore::new());
    let owm_like = Arc::new(UploadService::new(
        "owm",
        MockProtocol::new(),
        Arc::new(AggregationEngine::new(store, Tz::UTC)),
        status.clone(),
        clock.clone(),
        settings(40, 7, false, true),
    ));
    let dispatcher = Dispatcher::new(vec![owm_like.clone() as Arc<dyn Uploader>]);

    let attempts = dispatcher.tick().await;
    assert_eq!(attempts.len(), 7);
    let uploaded: Vec<_> = attempts.iter().map(|a| a.reading_at).collect();
    let expected: Vec<_> = (281..288)
        .map(|i| START + Duration::minutes(5 * i))
        .collect();
    assert_eq!(uploaded, expected);

    // Attempts began at least an interval apart
    let sleeps = clock.sleeps();
    for pair in sleeps.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::seconds(40));
    }
    assert_eq!(status.upload_status("owm").unwrap().watermark, uploaded.last().copied());
}

#[tokio::test]
async fn watermark_advances_only_on_success() {
    let store = five_minutely(1);
    let clock = Arc::new(ManualClock::new(START + Duration::hours(1)));
    let status = Arc::new(MemoryStatusStore::new());
    let service = Arc::new(UploadService::new(
        "owm",
        MockProtocol::new(),
        Arc::new(AggregationEngine::new(store, Tz::UTC)),
        status.clone(),
        clock.clone(),
        settings(40, 3, false, true),
    ));
    let dispatcher = Dispatcher::new(vec![service.clone() as Arc<dyn Uploader>]);

    service.protocol().fail_after(0, MockFailure::ServerError);
    let attempts = dispatcher.tick().await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, Outcome::RetryableFailure);
    assert_eq!(status.upload_status("owm").unwrap().watermark, None);

    // The same reading leads the next pass
    service.protocol().heal();
    clock.advance(Duration::seconds(40));
    let attempts = dispatcher.tick().await;
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0].reading_at, START + Duration::minutes(45));
    assert_eq!(
        status.upload_status("owm").unwrap().watermark,
        Some(START + Duration::minutes(55))
    );
}

#[tokio::test]
async fn permanent_failure_does_not_disable_destination() {
    let store = five_minutely(1);
    let clock = Arc::new(ManualClock::new(START + Duration::hours(1)));
    let service = Arc::new(UploadService::new(
        "cwop",
        MockProtocol::new(),
        Arc::new(AggregationEngine::new(store, Tz::UTC)),
        Arc::new(MemoryStatusStore::new()),
        clock.clone(),
        settings(60, 0, true, false),
    ));
    let dispatcher = Dispatcher::new(vec![service.clone() as Arc<dyn Uploader>]);

    service.protocol().fail_next(MockFailure::BadRequest);
    let attempts = dispatcher
        .on_live_reading(&Reading::new(START + Duration::minutes(55)))
        .await;
    assert_eq!(attempts[0].outcome, Outcome::PermanentFailure);

    clock.advance(Duration::seconds(60));
    let attempts = dispatcher
        .on_live_reading(&Reading::new(START + Duration::minutes(56)))
        .await;
    assert_eq!(attempts[0].outcome, Outcome::Success);
}

#[tokio::test(start_paused = true)]
async fn slow_catch_up_does_not_hold_back_other_destinations() {
    let clock = Arc::new(ManualClock::new(START + Duration::hours(1)));
    let slow = Arc::new(UploadService::new(
        "slow",
        MockProtocol::new(),
        Arc::new(AggregationEngine::new(five_minutely(1), Tz::UTC)),
        Arc::new(MemoryStatusStore::new()),
        clock.clone(),
        settings(290, 7, false, true),
    ));
    slow.protocol()
        .set_send_latency(std::time::Duration::from_millis(300));
    let fast = Arc::new(UploadService::new(
        "fast",
        MockProtocol::new(),
        Arc::new(AggregationEngine::new(five_minutely(1), Tz::UTC)),
        Arc::new(MemoryStatusStore::new()),
        clock.clone(),
        settings(40, 3, false, true),
    ));
    fast.protocol().fail_next(MockFailure::ServerError);
    let dispatcher = Arc::new(Dispatcher::new(vec![
        slow.clone() as Arc<dyn Uploader>,
        fast.clone() as Arc<dyn Uploader>,
    ]));

    let first_pass = tokio::spawn({
        let dispatcher = dispatcher.clone();
        async move { dispatcher.tick().await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(!first_pass.is_finished());
    assert!(fast.protocol().sent().is_empty());

    // The next tick retries the fast destination while the slow one is
    // still catching up
    fast.protocol().heal();
    let retry = dispatcher.tick().await;
    assert_eq!(retry.len(), 3);
    assert!(retry.iter().all(|a| a.destination == "fast" && a.outcome.is_success()));
    assert!(!first_pass.is_finished());

    let first = first_pass.await.unwrap();
    assert_eq!(first.iter().filter(|a| a.destination == "slow").count(), 7);
    assert_eq!(first.iter().filter(|a| a.destination == "fast").count(), 1);
    assert_eq!(slow.protocol().max_in_flight(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_destination_never_has_two_attempts_in_flight() {
    let store = five_minutely(2);
    let clock = Arc::new(ManualClock::new(START + Duration::hours(2)));
    let service = Arc::new(UploadService::new(
        "busy",
        MockProtocol::new(),
        Arc::new(AggregationEngine::new(store, Tz::UTC)),
        Arc::new(MemoryStatusStore::new()),
        clock.clone(),
        settings(1, 5, true, true),
    ));
    service
        .protocol()
        .set_send_latency(std::time::Duration::from_millis(20));
    let dispatcher = Arc::new(Dispatcher::new(vec![service.clone() as Arc<dyn Uploader>]));

    let mut handles = Vec::new();
    for i in 0..8 {
        let dispatcher = dispatcher.clone();
        let clock = clock.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                dispatcher.tick().await;
            } else {
                let reading = Reading::new(clock.now());
                dispatcher.on_live_reading(&reading).await;
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(service.protocol().opened_sessions() >= 1);
    assert_eq!(service.protocol().max_in_flight(), 1);
}

#[tokio::test]
async fn status_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weather.db");
    let readings: Vec<_> = (0..12)
        .map(|i| Reading::new(START + Duration::minutes(5 * i)).with(Field::Rain, 0.0))
        .collect();
    let clock = Arc::new(ManualClock::new(START + Duration::hours(1)));

    {
        let store = Arc::new(Store::open(&path).unwrap());
        store.insert_readings(&readings).unwrap();
        let service = UploadService::new(
            "owm",
            MockProtocol::new(),
            Arc::new(AggregationEngine::new(store.clone(), Tz::UTC)),
            store,
            clock.clone(),
            settings(40, 3, false, true),
        );
        assert_eq!(service.catch_up().await.len(), 3);
    }

    let store = Arc::new(Store::open(&path).unwrap());
    let status = store.upload_status("owm").unwrap();
    assert_eq!(status.watermark, Some(START + Duration::minutes(55)));
    assert!(status.last_attempt_at.is_some());

    let service = UploadService::new(
        "owm",
        MockProtocol::new(),
        Arc::new(AggregationEngine::new(store.clone(), Tz::UTC)),
        store,
        clock,
        settings(40, 3, false, true),
    );
    assert!(service.pending().unwrap().is_empty());
}
