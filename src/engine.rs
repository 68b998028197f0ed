// src/engine.rs
//
// =============================================================================
// GPUHOLD: ALLOCATION ENGINE (spec.md §4.1, spec_full.md §6)
// =============================================================================
//
// The atomic reserve/release/sweep operation. Every mutating entry point
// acquires the named allocation lock for its whole body; nothing here ever
// observes an availability check without also holding the lock across the
// write that follows it.

use crate::config::{MRU_HISTORY_SCAN_LIMIT, USAGE_HISTORY_TTL_DAYS};
use crate::error::GpuholdError;
use crate::kv::KvStore;
use crate::lock::AllocationLock;
use crate::queue;
use crate::state::{
    gpu_key, GpuId, GpuRecord, LeaseType, PoolMeta, Provider, ReserveRequest, UsageRecord,
    LOCK_KEY, POOL_META_KEY, QUEUE_KEY, USAGE_HISTORY_KEY,
};
use crate::time::{Clock, Timestamp};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

pub struct ReleaseOutcome {
    pub released: Vec<GpuId>,
    pub skipped: Vec<GpuId>,
}

pub struct AllocationEngine {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    lock: AllocationLock,
    heartbeat_timeout: Duration,
}

impl AllocationEngine {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, heartbeat_timeout: Duration) -> Self {
        let lock = AllocationLock::new(kv.clone(), LOCK_KEY);
        Self {
            kv,
            clock,
            lock,
            heartbeat_timeout,
        }
    }

    pub async fn pool_meta(&self) -> anyhow::Result<Option<PoolMeta>> {
        crate::kv::get_json(self.kv.as_ref(), POOL_META_KEY).await
    }

    pub async fn init_pool(
        &self,
        gpu_count: u32,
        provider: Provider,
        force: bool,
    ) -> Result<(), GpuholdError> {
        let _guard = self.lock.acquire().await?;
        if self.pool_meta().await.unwrap_or(None).is_some() && !force {
            return Err(GpuholdError::AlreadyInitialized);
        }
        if force {
            for id in 0..gpu_count {
                let _ = self.kv.delete(&gpu_key(id)).await;
            }
            let _ = self.kv.delete(QUEUE_KEY).await;
        }
        let meta = PoolMeta { gpu_count, provider };
        crate::kv::set_json(self.kv.as_ref(), POOL_META_KEY, &meta)
            .await
            .map_err(|_| GpuholdError::ProviderUnavailable)
    }

    async fn require_pool(&self) -> Result<PoolMeta, GpuholdError> {
        self.pool_meta()
            .await
            .ok()
            .flatten()
            .ok_or(GpuholdError::NotInitialized)
    }

    pub async fn record(&self, id: GpuId) -> anyhow::Result<GpuRecord> {
        Ok(crate::kv::get_json(self.kv.as_ref(), &gpu_key(id)).await?.unwrap_or_default())
    }

    async fn write_record(&self, id: GpuId, record: &GpuRecord) -> anyhow::Result<()> {
        crate::kv::set_json(self.kv.as_ref(), &gpu_key(id), record).await
    }

    fn is_free(&self, record: &GpuRecord, now: Timestamp) -> bool {
        match record {
            GpuRecord::Available { .. } => true,
            GpuRecord::Reserved {
                user,
                lease_type,
                last_heartbeat,
                expiry_time,
                ..
            } => {
                if user.is_empty() {
                    return true;
                }
                match lease_type {
                    LeaseType::Run => last_heartbeat
                        .map(|hb| now.since(hb) > self.heartbeat_timeout)
                        .unwrap_or(true),
                    LeaseType::Manual => expiry_time.map(|exp| now.inner() > exp.inner()).unwrap_or(true),
                }
            }
        }
    }

    fn eligible(
        &self,
        record: &GpuRecord,
        id: GpuId,
        excludes: &HashSet<GpuId>,
        force: bool,
        now: Timestamp,
    ) -> bool {
        self.is_free(record, now) && (force || !excludes.contains(&id))
    }

    /// Idempotent pass: reaps expired manual leases and stale run leases,
    /// appends a history record for each, transitions them to available,
    /// and gives the queue head a chance to claim the freed ids. Runs
    /// before any status read or allocation attempt (spec.md §4.1).
    pub async fn sweep(&self) -> anyhow::Result<Vec<GpuId>> {
        let meta = match self.pool_meta().await? {
            Some(m) => m,
            None => return Ok(Vec::new()),
        };
        let _guard = self.lock.acquire().await.map_err(anyhow::Error::from)?;
        let now = self.clock.now();
        let mut freed = Vec::new();

        for id in 0..meta.gpu_count {
            let record = self.record(id).await?;
            if let GpuRecord::Reserved {
                user,
                start_time,
                lease_type,
                last_heartbeat,
                expiry_time,
                ..
            } = &record
            {
                let stale = match lease_type {
                    LeaseType::Run => last_heartbeat
                        .map(|hb| now.since(hb) > self.heartbeat_timeout)
                        .unwrap_or(false),
                    LeaseType::Manual => expiry_time.map(|exp| now.inner() > exp.inner()).unwrap_or(false),
                };
                if stale && !user.is_empty() {
                    self.finish_lease(id, user.clone(), *start_time, *lease_type, now)
                        .await?;
                    freed.push(id);
                }
            }
        }

        // Reaping dead-client/timed-out waiters doesn't depend on a GPU
        // record going stale this tick -- run it every sweep so an idle
        // `wait_timeout` still fires (spec.md §4.2).
        let queue_freed = queue::reap_expired(self.kv.as_ref(), now).await?;
        freed.extend(queue_freed);

        if !freed.is_empty() {
            queue::try_fill_head(self.kv.as_ref(), &freed, now).await?;
        }
        Ok(freed)
    }

    async fn finish_lease(
        &self,
        id: GpuId,
        user: String,
        start_time: Timestamp,
        lease_type: LeaseType,
        now: Timestamp,
    ) -> anyhow::Result<()> {
        self.write_record(id, &GpuRecord::Available { last_released: Some(now) })
            .await?;
        let history = UsageRecord::new(user, id, start_time, now, lease_type);
        self.kv
            .zadd(USAGE_HISTORY_KEY, now.epoch_seconds(), &serde_json::to_string(&history)?)
            .await?;
        let cutoff = now.epoch_seconds() - (USAGE_HISTORY_TTL_DAYS as f64) * 86400.0;
        self.kv
            .zremrangebyscore_older_than(USAGE_HISTORY_KEY, cutoff)
            .await?;
        self.kv
            .expire(USAGE_HISTORY_KEY, Duration::from_secs(USAGE_HISTORY_TTL_DAYS as u64 * 86400))
            .await?;
        Ok(())
    }

    /// The atomic reserve operation (spec.md §4.1). `unreserved_excludes`
    /// comes from the validator; bypassed per-id when `request.force` is set.
    pub async fn reserve(
        &self,
        request: &ReserveRequest,
        unreserved_excludes: &HashSet<GpuId>,
    ) -> Result<Vec<GpuId>, GpuholdError> {
        let meta = self.require_pool().await?;
        let count = request.resolved_count()?;
        let _guard = self.lock.acquire().await?;
        let now = self.clock.now();

        for id in request.ids.iter().flatten() {
            if *id >= meta.gpu_count {
                return Err(GpuholdError::InvalidGpuId(*id, meta.gpu_count));
            }
        }

        let selected = if let Some(ids) = &request.ids {
            let mut held = 0usize;
            let mut excluded = 0usize;
            let mut available = 0usize;
            for id in ids {
                let record = self.record(*id).await.map_err(|_| GpuholdError::StateCorrupt(*id))?;
                if self.eligible(&record, *id, unreserved_excludes, request.force, now) {
                    available += 1;
                } else if record.is_reserved() && !self.is_free(&record, now) {
                    held += 1;
                } else {
                    excluded += 1;
                }
            }
            if held + excluded > 0 {
                // Every id in request.ids must be eligible; never partially
                // reserve a specific-ids request in the synchronous path
                // (spec.md §4.1).
                return Err(GpuholdError::InsufficientResources {
                    requested: count,
                    available,
                    held,
                    excluded,
                });
            }
            ids.clone()
        } else {
            let ordering = self.selection_order(&meta, unreserved_excludes, request, now).await?;
            if ordering.eligible.len() < count {
                return Err(GpuholdError::InsufficientResources {
                    requested: count,
                    available: ordering.eligible.len(),
                    held: ordering.held,
                    excluded: ordering.excluded,
                });
            }
            ordering.eligible.into_iter().take(count).collect()
        };

        for id in &selected {
            let record = GpuRecord::Reserved {
                user: request.user.clone(),
                actual_user: request.actual_user.clone(),
                start_time: now,
                lease_type: request.lease_type,
                note: request.note.clone(),
                last_heartbeat: matches!(request.lease_type, LeaseType::Run).then_some(now),
                expiry_time: request.expiry_time,
            };
            self.write_record(*id, &record).await.map_err(anyhow_to_corrupt(*id))?;
        }

        Ok(selected)
    }

    async fn selection_order(
        &self,
        meta: &PoolMeta,
        unreserved_excludes: &HashSet<GpuId>,
        request: &ReserveRequest,
        now: Timestamp,
    ) -> Result<SelectionOrder, GpuholdError> {
        let mut eligible_ids = Vec::new();
        let mut held = 0usize;
        let mut excluded = 0usize;

        let mut last_released: HashMap<GpuId, Option<Timestamp>> = HashMap::new();

        for id in 0..meta.gpu_count {
            let record = self
                .record(id)
                .await
                .map_err(|_| GpuholdError::StateCorrupt(id))?;
            if self.eligible(&record, id, unreserved_excludes, request.force, now) {
                eligible_ids.push(id);
                if let GpuRecord::Available { last_released: lr } = &record {
                    last_released.insert(id, *lr);
                } else {
                    last_released.insert(id, None);
                }
            } else if record.is_reserved() && !self.is_free(&record, now) {
                held += 1;
            } else {
                excluded += 1;
            }
        }

        // MRU-per-user: latest end_time this user used each GPU, scanning
        // the 100 most recent history records (spec.md §4.1 step 1).
        let mut mru: HashMap<GpuId, Timestamp> = HashMap::new();
        let raw = self
            .kv
            .zrevrange(USAGE_HISTORY_KEY, 0, MRU_HISTORY_SCAN_LIMIT - 1)
            .await
            .unwrap_or_default();
        for entry in raw {
            if let Ok(rec) = serde_json::from_str::<UsageRecord>(&entry) {
                if rec.user == request.user {
                    mru.entry(rec.gpu_id)
                        .and_modify(|best| {
                            if rec.end_time.inner() > best.inner() {
                                *best = rec.end_time;
                            }
                        })
                        .or_insert(rec.end_time);
                }
            }
        }

        eligible_ids.sort_by(|a, b| {
            let a_mru = mru.get(a);
            let b_mru = mru.get(b);
            match (a_mru, b_mru) {
                (Some(at), Some(bt)) => bt.inner().cmp(&at.inner()),
                (Some(_), None) => std::cmp::Ordering::Less,
                (None, Some(_)) => std::cmp::Ordering::Greater,
                (None, None) => {
                    let a_lr = last_released.get(a).copied().flatten();
                    let b_lr = last_released.get(b).copied().flatten();
                    match (a_lr, b_lr) {
                        (Some(at), Some(bt)) => at.inner().cmp(&bt.inner()),
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (None, None) => a.cmp(b),
                    }
                }
            }
        });

        Ok(SelectionOrder {
            eligible: eligible_ids,
            held,
            excluded,
        })
    }

    /// ReleaseAll: every GPU whose record matches `actual_user` with
    /// `type=manual` (spec.md §4.1).
    pub async fn release_all(&self, actual_user: &str) -> anyhow::Result<Vec<GpuId>> {
        let meta = match self.pool_meta().await? {
            Some(m) => m,
            None => return Ok(Vec::new()),
        };
        let _guard = self.lock.acquire().await.map_err(anyhow::Error::from)?;
        let now = self.clock.now();
        let mut released = Vec::new();

        for id in 0..meta.gpu_count {
            let record = self.record(id).await?;
            if let GpuRecord::Reserved {
                actual_user: owner,
                user,
                start_time,
                lease_type: LeaseType::Manual,
                ..
            } = &record
            {
                if owner == actual_user {
                    self.finish_lease(id, user.clone(), *start_time, LeaseType::Manual, now)
                        .await?;
                    released.push(id);
                }
            }
        }

        if !released.is_empty() {
            queue::try_fill_head(self.kv.as_ref(), &released, now).await?;
        }
        Ok(released)
    }

    /// ReleaseSpecific: releases ids owned by `actual_user` (either type);
    /// ids owned by someone else are silently skipped (spec.md §7, §11).
    pub async fn release_specific(
        &self,
        actual_user: &str,
        ids: &[GpuId],
    ) -> anyhow::Result<ReleaseOutcome> {
        let meta = match self.pool_meta().await? {
            Some(m) => m,
            None => return Ok(ReleaseOutcome { released: Vec::new(), skipped: ids.to_vec() }),
        };
        let _guard = self.lock.acquire().await.map_err(anyhow::Error::from)?;
        let now = self.clock.now();
        let mut released = Vec::new();
        let mut skipped = Vec::new();

        for &id in ids {
            if id >= meta.gpu_count {
                skipped.push(id);
                continue;
            }
            let record = self.record(id).await?;
            match &record {
                GpuRecord::Reserved {
                    actual_user: owner,
                    user,
                    start_time,
                    lease_type,
                    ..
                } if owner == actual_user => {
                    self.finish_lease(id, user.clone(), *start_time, *lease_type, now)
                        .await?;
                    released.push(id);
                }
                _ => skipped.push(id),
            }
        }

        if !released.is_empty() {
            queue::try_fill_head(self.kv.as_ref(), &released, now).await?;
        }
        Ok(ReleaseOutcome { released, skipped })
    }

    /// Refreshes `last_heartbeat` for a `run` lease, but only if the record
    /// still belongs to the same `(actual_user, start_time)` pair -- if the
    /// sweep already reaped or reassigned it, the tick must not resurrect
    /// the lease (spec.md §4.3).
    pub async fn tick_heartbeat(
        &self,
        id: GpuId,
        actual_user: &str,
        start_time: Timestamp,
    ) -> anyhow::Result<bool> {
        let _guard = self.lock.acquire().await.map_err(anyhow::Error::from)?;
        let now = self.clock.now();
        let record = self.record(id).await?;
        match record {
            GpuRecord::Reserved {
                actual_user: owner,
                start_time: owned_start,
                lease_type: LeaseType::Run,
                user,
                note,
                expiry_time,
                ..
            } if owner == actual_user && owned_start == start_time => {
                self.write_record(
                    id,
                    &GpuRecord::Reserved {
                        user,
                        actual_user: owner,
                        start_time: owned_start,
                        lease_type: LeaseType::Run,
                        note,
                        last_heartbeat: Some(now),
                        expiry_time,
                    },
                )
                .await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

struct SelectionOrder {
    eligible: Vec<GpuId>,
    held: usize,
    excluded: usize,
}

fn anyhow_to_corrupt(id: GpuId) -> impl FnOnce(anyhow::Error) -> GpuholdError {
    move |_| GpuholdError::StateCorrupt(id)
}
