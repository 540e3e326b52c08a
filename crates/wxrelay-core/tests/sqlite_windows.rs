//! Window statistics against an on-disk SQLite store.

use std::sync::Arc;

use time::Duration;
use time::macros::datetime;
use wxrelay_core::{AggregationEngine, Tz, dedupe_by_interval};
use wxrelay_store::{ReadingStore, Store};
use wxrelay_types::{Field, Reading};

fn local_day_store(dir: &tempfile::TempDir) -> Store {
    let store = Store::open(dir.path().join("weather.db")).unwrap();
    // 00:00-23:00 Europe/London in summer is 23:00-22:00 UTC
    let start = datetime!(2024-06-30 23:00 UTC);
    let rain = [0.0, 1.0, 3.0, 3.0, 7.0];
    let readings: Vec<_> = (0..24)
        .map(|h| {
            Reading::new(start + Duration::hours(h))
                .with(Field::TempOut, 10.0 + 2.0 * (h / 2) as f64)
                .with(Field::HumOut, 70.0)
                .with(Field::Rain, rain[(h as usize).min(rain.len() - 1)])
        })
        .collect();
    store.insert_readings(&readings).unwrap();
    store
}

#[test]
fn hourly_local_day_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_day_store(&dir);
    let engine = AggregationEngine::new(Arc::new(store), Tz::Europe__London);

    let last = datetime!(2024-07-01 22:00 UTC);
    let window = engine.trailing_max(Field::TempOut, last).unwrap();
    assert_eq!(window.value, 32.0);

    let window = engine.rain_since_midnight(last).unwrap();
    assert_eq!(window.value, 7.0);
}

#[test]
fn derive_uses_local_midnight() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_day_store(&dir);
    let engine = AggregationEngine::new(Arc::new(store), Tz::Europe__London);

    let reading = engine
        .store()
        .nearest(datetime!(2024-07-01 02:00 UTC))
        .unwrap()
        .unwrap();
    let derived = engine.derive(&reading);
    assert_eq!(derived.rain_day, Some(3.0));
    assert_eq!(derived.rain_hour, Some(0.0));
    assert_eq!(derived.max_temp_24h, Some(12.0));
}

#[test]
fn dedupe_over_sqlite_range() {
    let dir = tempfile::tempdir().unwrap();
    let store = local_day_store(&dir);
    let start = datetime!(2024-06-30 23:00 UTC);

    let emitted: Vec<_> =
        dedupe_by_interval(&store, start, start + Duration::hours(24), Duration::minutes(90))
            .unwrap()
            .collect();
    assert_eq!(emitted.len(), 12);
    assert_eq!(emitted[0].timestamp, start);
}
