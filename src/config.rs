// src/config.rs
//
// =============================================================================
// GPUHOLD: AMBIENT CONFIGURATION
// =============================================================================
//
// No file-based config layer -- just env-var overrides on top of built-in
// defaults, read inline rather than through a config-file object.

use std::time::Duration;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const LOCK_TTL: Duration = Duration::from_secs(10);
pub const LOCK_MAX_ATTEMPTS: u32 = 5;
pub const LOCK_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const SUPERVISOR_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const SUPERVISOR_KILL_GRACE: Duration = Duration::from_secs(30);
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const USAGE_HISTORY_TTL_DAYS: i64 = 90;
pub const MRU_HISTORY_SCAN_LIMIT: isize = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub memory_threshold_mb: u64,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            memory_threshold_mb: 1024,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            heartbeat_timeout: HEARTBEAT_TIMEOUT,
        }
    }
}

impl Config {
    /// Layers environment variables over the defaults. CLI flags, where
    /// present, are applied by the caller after this (flags win).
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(url) = std::env::var("GPUHOLD_REDIS_URL") {
            cfg.redis_url = url;
        }
        if let Ok(v) = std::env::var("GPUHOLD_MEMORY_THRESHOLD_MB") {
            if let Ok(parsed) = v.parse() {
                cfg.memory_threshold_mb = parsed;
            } else {
                log::warn!("ignoring invalid GPUHOLD_MEMORY_THRESHOLD_MB={v:?}");
            }
        }
        if let Ok(v) = std::env::var("GPUHOLD_HEARTBEAT_INTERVAL_S") {
            match v.parse::<u64>() {
                Ok(secs) => cfg.heartbeat_interval = Duration::from_secs(secs),
                Err(_) => log::warn!("ignoring invalid GPUHOLD_HEARTBEAT_INTERVAL_S={v:?}"),
            }
        }
        if let Ok(v) = std::env::var("GPUHOLD_HEARTBEAT_TIMEOUT_S") {
            match v.parse::<u64>() {
                Ok(secs) => cfg.heartbeat_timeout = Duration::from_secs(secs),
                Err(_) => log::warn!("ignoring invalid GPUHOLD_HEARTBEAT_TIMEOUT_S={v:?}"),
            }
        }

        if cfg.heartbeat_timeout < cfg.heartbeat_interval * 2 {
            log::warn!(
                "heartbeat_timeout ({:?}) is less than 2x heartbeat_interval ({:?}); \
                 leases may be reaped while still live",
                cfg.heartbeat_timeout,
                cfg.heartbeat_interval
            );
        }

        cfg
    }
}
