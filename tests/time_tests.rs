// tests/time_tests.rs -- Timestamp round-trip and Clock behavior (spec_full.md §2)

use chrono::Utc;
use gpuhold::time::{parse_timestamp_value, Clock, FixedClock, Timestamp};
use std::time::Duration;

#[test]
fn round_trips_epoch_seconds() {
    let v = serde_json::json!(1_700_000_000.5);
    let ts = parse_timestamp_value(&v).unwrap();
    assert!((ts.epoch_seconds() - 1_700_000_000.5).abs() < 1e-6);
}

#[test]
fn round_trips_iso8601() {
    let s = Utc::now().to_rfc3339();
    let v = serde_json::json!(s);
    let ts = parse_timestamp_value(&v).unwrap();
    assert_eq!(ts.inner().to_rfc3339(), s);
}

#[test]
fn fixed_clock_advances() {
    let clock = FixedClock::new(Timestamp::from_datetime(Utc::now()));
    let t0 = clock.now();
    clock.advance(Duration::from_secs(10));
    let t1 = clock.now();
    assert_eq!(t1.since(t0), Duration::from_secs(10));
}
