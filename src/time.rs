// src/time.rs
//
// =============================================================================
// GPUHOLD: TIME SOURCE
// =============================================================================
//
// Wall-clock is authoritative for every lease computation (§1 of SPEC_FULL).
// `Timestamp` accepts either shape the KV store might hand back -- an
// epoch-seconds number or an ISO-8601 string -- and always serializes back
// out as ISO-8601 UTC, per the canonical form spec_full.md §2 calls for.

use chrono::{DateTime, TimeZone, Utc};
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    pub fn epoch_seconds(&self) -> f64 {
        self.0.timestamp() as f64 + self.0.timestamp_subsec_nanos() as f64 / 1e9
    }

    pub fn inner(&self) -> DateTime<Utc> {
        self.0
    }

    pub fn checked_add(&self, d: Duration) -> Self {
        Self(self.0 + chrono::Duration::from_std(d).unwrap_or_default())
    }

    /// Saturating duration since an earlier timestamp; zero if `other` is later.
    pub fn since(&self, other: Timestamp) -> Duration {
        let delta = self.0 - other.0;
        delta.to_std().unwrap_or(Duration::ZERO)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_rfc3339())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        parse_timestamp_value(&raw).map_err(DeError::custom)
    }
}

/// Accepts epoch-seconds (int or float) or an ISO-8601 string, matching
/// whichever shape the KV store's scripting facility happened to produce.
pub fn parse_timestamp_value(value: &serde_json::Value) -> anyhow::Result<Timestamp> {
    if let Some(f) = value.as_f64() {
        let secs = f.trunc() as i64;
        let nanos = ((f.fract()) * 1e9).round() as u32;
        let dt = Utc
            .timestamp_opt(secs, nanos)
            .single()
            .ok_or_else(|| anyhow::anyhow!("epoch seconds {f} out of range"))?;
        return Ok(Timestamp(dt));
    }
    if let Some(s) = value.as_str() {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|e| anyhow::anyhow!("invalid ISO-8601 timestamp {s:?}: {e}"))?
            .with_timezone(&Utc);
        return Ok(Timestamp(dt));
    }
    Err(anyhow::anyhow!("timestamp must be a number or string, got {value}"))
}

/// Injected everywhere instead of calling `Utc::now()` directly so tests can
/// pin and advance time deterministically (crash-recovery / expiry scenarios).
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp(Utc::now())
    }
}

pub struct FixedClock {
    current: std::sync::Mutex<Timestamp>,
}

impl FixedClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: std::sync::Mutex::new(start),
        }
    }

    pub fn advance(&self, d: Duration) {
        let mut guard = self.current.lock().unwrap();
        *guard = guard.checked_add(d);
    }

    pub fn set(&self, t: Timestamp) {
        *self.current.lock().unwrap() = t;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> Timestamp {
        *self.current.lock().unwrap()
    }
}
