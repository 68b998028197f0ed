// src/validator.rs
//
// =============================================================================
// GPUHOLD: VALIDATOR / STATUS ASSEMBLER (spec.md §4.5, §4.6)
// =============================================================================
//
// Joins reservation state with usage probe output: computes the
// unreserved_excludes set the allocation engine must honor, and assembles
// the per-GPU status view the `status` command prints.

use crate::engine::AllocationEngine;
use crate::probe::{resolve_username, GpuProvider, GpuUsage};
use crate::state::{GpuId, GpuRecord};
use crate::time::{Clock, Timestamp};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub enum GpuStatus {
    Available {
        last_released: Option<Timestamp>,
        memory_mb_used: u64,
    },
    InUse {
        user: String,
        lease_kind: &'static str,
        start_time: Timestamp,
        duration_s: f64,
        detail: LeaseDetail,
    },
    Unreserved {
        users: Vec<String>,
        processes: Vec<(u32, String, u64)>,
        memory_mb_used: u64,
    },
    Error {
        gpu_id: GpuId,
    },
}

#[derive(Debug, Clone)]
pub enum LeaseDetail {
    Heartbeat(Timestamp),
    Expiry(Timestamp),
}

pub struct Validator {
    engine: Arc<AllocationEngine>,
    provider: Arc<dyn GpuProvider>,
    clock: Arc<dyn Clock>,
    memory_threshold_mb: u64,
}

impl Validator {
    pub fn new(
        engine: Arc<AllocationEngine>,
        provider: Arc<dyn GpuProvider>,
        clock: Arc<dyn Clock>,
        memory_threshold_mb: u64,
    ) -> Self {
        Self {
            engine,
            provider,
            clock,
            memory_threshold_mb,
        }
    }

    /// A GPU is unreserved-in-use if its detected memory usage exceeds the
    /// threshold AND no reservation record currently owns it (spec.md §4.5).
    /// Probe failures degrade to "no usage data" rather than blocking
    /// allocation (ExternalCommandFailed, spec.md §7).
    pub async fn unreserved_excludes(&self, gpu_count: u32) -> HashSet<GpuId> {
        let usages = match self.probe_or_empty().await {
            Some(u) => u,
            None => return HashSet::new(),
        };

        let mut excludes = HashSet::new();
        for id in 0..gpu_count {
            let Some(usage) = usages.get(&id) else { continue };
            if usage.memory_mb_total_used <= self.memory_threshold_mb {
                continue;
            }
            if let Ok(record) = self.engine.record(id).await {
                if !record.is_reserved() {
                    excludes.insert(id);
                }
            }
        }
        excludes
    }

    async fn probe_or_empty(&self) -> Option<HashMap<GpuId, GpuUsage>> {
        if !self.provider.available().await {
            log::warn!(
                "gpu provider {:?} unavailable; validation degraded, allocation proceeds unguarded",
                self.provider.name()
            );
            return None;
        }
        match self.provider.probe().await {
            Ok(usages) => Some(usages),
            Err(e) => {
                log::warn!("gpu probe failed: {e}; treating as empty usage");
                None
            }
        }
    }

    pub async fn status(&self, gpu_count: u32) -> Vec<(GpuId, GpuStatus)> {
        let usages = self.probe_or_empty().await.unwrap_or_default();
        let now = self.clock.now();
        let mut out = Vec::with_capacity(gpu_count as usize);

        for id in 0..gpu_count {
            let usage = usages.get(&id).cloned().unwrap_or_default();
            let status = match self.engine.record(id).await {
                Ok(GpuRecord::Available { last_released }) => {
                    if usage.memory_mb_total_used > self.memory_threshold_mb {
                        let mut users: Vec<String> = Vec::new();
                        for p in &usage.processes {
                            let name = resolve_username(p.pid).await;
                            if !users.contains(&name) {
                                users.push(name);
                            }
                        }
                        GpuStatus::Unreserved {
                            users,
                            processes: usage
                                .processes
                                .iter()
                                .map(|p| (p.pid, p.process_name.clone(), p.memory_mb))
                                .take(10)
                                .collect(),
                            memory_mb_used: usage.memory_mb_total_used,
                        }
                    } else {
                        GpuStatus::Available {
                            last_released,
                            memory_mb_used: usage.memory_mb_total_used,
                        }
                    }
                }
                Ok(GpuRecord::Reserved {
                    user,
                    start_time,
                    lease_type,
                    last_heartbeat,
                    expiry_time,
                    ..
                }) => GpuStatus::InUse {
                    user,
                    lease_kind: match lease_type {
                        crate::state::LeaseType::Run => "run",
                        crate::state::LeaseType::Manual => "manual",
                    },
                    start_time,
                    duration_s: now.since(start_time).as_secs_f64(),
                    detail: match lease_type {
                        crate::state::LeaseType::Run => {
                            LeaseDetail::Heartbeat(last_heartbeat.unwrap_or(start_time))
                        }
                        crate::state::LeaseType::Manual => {
                            LeaseDetail::Expiry(expiry_time.unwrap_or(start_time))
                        }
                    },
                },
                Err(_) => GpuStatus::Error { gpu_id: id },
            };
            out.push((id, status));
        }
        out
    }
}
