// src/state.rs
//
// =============================================================================
// GPUHOLD: STATE MODEL (spec_full.md §5 / spec.md §3)
// =============================================================================
//
// Typed records for pool size, per-GPU state, queue entries, and usage
// history. These are the JSON shapes that travel in and out of the KV store
// via `KvStore::{get_json,set_json}`.

use crate::time::Timestamp;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type GpuId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Nvidia,
    Amd,
    Fake,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolMeta {
    pub gpu_count: u32,
    pub provider: Provider,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseType {
    Run,
    Manual,
}

/// One record per GPU id. The invariant from spec.md §3 -- a record either
/// has `user` set or `last_released` set, never both -- is enforced simply
/// by modeling it as an enum instead of an optional-everything struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum GpuRecord {
    #[serde(rename = "available")]
    Available { last_released: Option<Timestamp> },
    #[serde(rename = "reserved")]
    Reserved {
        user: String,
        actual_user: String,
        start_time: Timestamp,
        #[serde(rename = "type")]
        lease_type: LeaseType,
        #[serde(default)]
        note: Option<String>,
        #[serde(default)]
        last_heartbeat: Option<Timestamp>,
        #[serde(default)]
        expiry_time: Option<Timestamp>,
    },
}

impl Default for GpuRecord {
    fn default() -> Self {
        GpuRecord::Available { last_released: None }
    }
}

impl GpuRecord {
    pub fn is_reserved(&self) -> bool {
        matches!(self, GpuRecord::Reserved { .. })
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            GpuRecord::Reserved { actual_user, .. } => Some(actual_user),
            GpuRecord::Available { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveRequest {
    pub count: Option<usize>,
    pub ids: Option<Vec<GpuId>>,
    pub user: String,
    pub actual_user: String,
    #[serde(rename = "type")]
    pub lease_type: LeaseType,
    pub expiry_time: Option<Timestamp>,
    pub note: Option<String>,
    #[serde(default)]
    pub force: bool,
}

impl ReserveRequest {
    /// Resolves `count` vs `ids` per spec.md §4.1: if both present, count
    /// must equal len(ids); count defaults to 1 when ids is absent.
    pub fn resolved_count(&self) -> Result<usize, crate::error::GpuholdError> {
        match (&self.count, &self.ids) {
            (Some(c), Some(ids)) if *c != ids.len() => {
                Err(crate::error::GpuholdError::CountIdMismatch {
                    count: *c,
                    ids: ids.len(),
                })
            }
            (_, Some(ids)) => Ok(ids.len()),
            (Some(c), None) => Ok(*c),
            (None, None) => Ok(1),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub user: String,
    pub actual_user: String,
    pub requested_count: Option<usize>,
    pub requested_ids: Option<Vec<GpuId>>,
    pub allocated_ids: Vec<GpuId>,
    #[serde(rename = "type")]
    pub lease_type: LeaseType,
    /// The queue-wait deadline (from `--wait`), distinct from the eventual
    /// lease's own duration -- this is when *waiting* gives up, not when a
    /// granted manual reservation expires.
    pub expiry_or_timeout: Option<Timestamp>,
    /// The `--duration` requested for a manual reservation, re-anchored to
    /// the grant time once this entry reaches the head and is filled
    /// (`None` for `run` leases, which expire by heartbeat instead).
    #[serde(default)]
    pub lease_duration_secs: Option<f64>,
    pub note: Option<String>,
    pub enqueue_time: Timestamp,
    /// Liveness sentinel refreshed by the waiting client; used to reap
    /// entries whose client died before being signaled (spec.md §4.2).
    pub client_heartbeat: Timestamp,
}

impl QueueEntry {
    pub fn target_count(&self) -> usize {
        self.requested_ids
            .as_ref()
            .map(|ids| ids.len())
            .or(self.requested_count)
            .unwrap_or(1)
    }

    pub fn is_filled(&self) -> bool {
        self.allocated_ids.len() >= self.target_count()
    }

    pub fn wants(&self, gpu_id: GpuId) -> bool {
        match &self.requested_ids {
            Some(ids) => ids.contains(&gpu_id) && !self.allocated_ids.contains(&gpu_id),
            None => !self.allocated_ids.contains(&gpu_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub user: String,
    pub gpu_id: GpuId,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub duration_s: f64,
    #[serde(rename = "type")]
    pub lease_type: LeaseType,
}

impl UsageRecord {
    pub fn new(
        user: String,
        gpu_id: GpuId,
        start_time: Timestamp,
        end_time: Timestamp,
        lease_type: LeaseType,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user,
            gpu_id,
            start_time,
            end_time,
            duration_s: end_time.since(start_time).as_secs_f64(),
            lease_type,
        }
    }
}

/// Per-GPU KV key, e.g. `gpuhold:gpu:3`.
pub fn gpu_key(id: GpuId) -> String {
    format!("gpuhold:gpu:{id}")
}

pub const POOL_META_KEY: &str = "gpuhold:pool";
pub const LOCK_KEY: &str = "gpuhold:lock";
pub const USAGE_HISTORY_KEY: &str = "gpuhold:history";
pub const QUEUE_KEY: &str = "gpuhold:queue";
