// tests/duration_tests.rs -- duration grammar (spec_full.md §6.2)

use gpuhold::duration::parse_duration;
use std::time::Duration;

#[test]
fn empty_defaults_to_8h() {
    assert_eq!(parse_duration("").unwrap(), Duration::from_secs(8 * 3600));
}

#[test]
fn parses_fractional_hours() {
    assert_eq!(parse_duration("0.5h").unwrap(), Duration::from_secs(1800));
}

#[test]
fn parses_each_unit() {
    assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
    assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
    assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
}

#[test]
fn rejects_missing_unit() {
    assert!(parse_duration("30").is_err());
}

#[test]
fn rejects_negative() {
    assert!(parse_duration("-1h").is_err());
}
