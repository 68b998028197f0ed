// src/queue.rs
//
// =============================================================================
// GPUHOLD: QUEUE MANAGER (spec.md §4.2, spec_full.md §7)
// =============================================================================
//
// FCFS sequence of would-be reservations that couldn't be immediately
// served. `try_fill_head` is always invoked by the allocation engine while
// it still holds the allocation lock -- a release followed by a re-fill
// attempt is one atomic step, never two (spec.md §5's ordering guarantee).
// Only the head may gain GPUs from a single release event; no later waiter
// can overtake it even if it could be served from the remainder.

use crate::state::{gpu_key, GpuId, GpuRecord, LeaseType, QueueEntry, QUEUE_KEY};
use crate::time::Timestamp;
use crate::kv::KvStore;
use std::time::Duration;

fn grant_expiry_time(head: &QueueEntry, grant_time: Timestamp) -> Option<Timestamp> {
    match head.lease_type {
        LeaseType::Run => None,
        LeaseType::Manual => head
            .lease_duration_secs
            .map(|secs| grant_time.checked_add(Duration::from_secs_f64(secs))),
    }
}

/// A client waiting on a queue entry is considered dead if its liveness
/// sentinel hasn't been refreshed in this long.
pub const CLIENT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(15);

pub async fn enqueue(kv: &dyn KvStore, entry: &QueueEntry) -> anyhow::Result<()> {
    kv.list_push_back(QUEUE_KEY, &serde_json::to_string(entry)?).await
}

pub async fn list_entries(kv: &dyn KvStore) -> anyhow::Result<Vec<QueueEntry>> {
    let raw = kv.list_range(QUEUE_KEY).await?;
    Ok(raw
        .iter()
        .filter_map(|s| serde_json::from_str(s).ok())
        .collect())
}

/// Takes freshly-freed GPU ids and tries to extend the queue head's
/// allocation with them, one release event at a time. A head entry with
/// target N already holding k may receive any subset of `freed` up to
/// N - k; once full it's removed from the queue and the id set it now owns
/// is written back. Also reaps any dead-client entries found at the head
/// position and any entry whose `expiry_or_timeout` has elapsed while
/// partial, freeing whatever it already held.
pub async fn try_fill_head(
    kv: &dyn KvStore,
    freed: &[GpuId],
    now: Timestamp,
) -> anyhow::Result<()> {
    let mut remaining: Vec<GpuId> = freed.to_vec();
    let raw = kv.list_range(QUEUE_KEY).await?;
    let mut entries: Vec<QueueEntry> = raw
        .iter()
        .filter_map(|s| serde_json::from_str(s).ok())
        .collect();

    loop {
        if entries.is_empty() {
            break;
        }
        if let Some(newly_freed) = reap_if_dead_or_timed_out(kv, &mut entries, now).await? {
            // A reaped head may free ids a still-waiting entry behind it
            // wants; feed them back into this same fill pass.
            remaining.extend(newly_freed);
            continue;
        }
        if remaining.is_empty() {
            break;
        }

        let head_raw = serde_json::to_string(&entries[0])?;
        let head = &mut entries[0];
        let target = head.target_count();
        let mut taken = Vec::new();
        remaining.retain(|id| {
            if head.allocated_ids.len() + taken.len() < target && head.wants(*id) {
                taken.push(*id);
                false
            } else {
                true
            }
        });

        if taken.is_empty() {
            // Head can't use anything freed this round; strict FCFS means we
            // still don't let a later waiter take it instead.
            break;
        }

        let expiry_time = grant_expiry_time(head, now);
        for id in &taken {
            let record = GpuRecord::Reserved {
                user: head.user.clone(),
                actual_user: head.actual_user.clone(),
                start_time: now,
                lease_type: head.lease_type,
                note: head.note.clone(),
                last_heartbeat: matches!(head.lease_type, LeaseType::Run).then_some(now),
                expiry_time,
            };
            crate::kv::set_json(kv, &gpu_key(*id), &record).await?;
        }
        head.allocated_ids.extend(taken);

        if head.is_filled() {
            kv.list_remove(QUEUE_KEY, &head_raw).await?;
            entries.remove(0);
            // Filled entries drop out of the FCFS line entirely; the next
            // entry becomes the head for whatever ids remain this round.
        } else {
            let new_raw = serde_json::to_string(&head)?;
            kv.list_replace(QUEUE_KEY, &head_raw, &new_raw).await?;
            // A still-partial head keeps its place; no later waiter may be
            // served from the same release event.
            break;
        }
    }

    Ok(())
}

/// Checks the (still-)head entry for a dead client or an elapsed
/// `wait_timeout`, releasing any partial allocation and dropping it from
/// the queue if so. Returns the ids freed (if any), so a caller still
/// processing a fill pass can immediately offer them to the next waiter.
async fn reap_if_dead_or_timed_out(
    kv: &dyn KvStore,
    entries: &mut Vec<QueueEntry>,
    now: Timestamp,
) -> anyhow::Result<Option<Vec<GpuId>>> {
    let Some(head) = entries.first() else {
        return Ok(None);
    };

    let dead = now.since(head.client_heartbeat) > CLIENT_HEARTBEAT_TIMEOUT;
    let timed_out = head
        .expiry_or_timeout
        .map(|deadline| now.inner() > deadline.inner() && !head.is_filled())
        .unwrap_or(false);

    if !dead && !timed_out {
        return Ok(None);
    }

    let head_raw = serde_json::to_string(head)?;
    for id in &head.allocated_ids {
        crate::kv::set_json(kv, &gpu_key(*id), &GpuRecord::Available { last_released: Some(now) }).await?;
    }
    let freed = head.allocated_ids.clone();
    kv.list_remove(crate::state::QUEUE_KEY, &head_raw).await?;
    entries.remove(0);
    Ok(Some(freed))
}

/// Independent of any release event: walks the queue from the head reaping
/// dead-client or timed-out entries, returning any GPU ids their partial
/// allocations freed. The engine's sweep calls this unconditionally so an
/// idle `wait_timeout` still fires even when nothing else is being released
/// this tick (spec.md §4.2 "entry timeout").
pub async fn reap_expired(kv: &dyn KvStore, now: Timestamp) -> anyhow::Result<Vec<GpuId>> {
    let raw = kv.list_range(QUEUE_KEY).await?;
    let mut entries: Vec<QueueEntry> = raw.iter().filter_map(|s| serde_json::from_str(s).ok()).collect();
    let mut freed = Vec::new();

    while let Some(newly_freed) = reap_if_dead_or_timed_out(kv, &mut entries, now).await? {
        freed.extend(newly_freed);
    }

    Ok(freed)
}

/// Called periodically by a live waiting client so it isn't mistaken for
/// dead by `reap_if_dead_or_timed_out`.
pub async fn refresh_client_heartbeat(
    kv: &dyn KvStore,
    entry_id: &str,
    now: Timestamp,
) -> anyhow::Result<()> {
    let entries = list_entries(kv).await?;
    if let Some(entry) = entries.iter().find(|e| e.id == entry_id) {
        let old_raw = serde_json::to_string(entry)?;
        let mut updated = entry.clone();
        updated.client_heartbeat = now;
        let new_raw = serde_json::to_string(&updated)?;
        kv.list_replace(QUEUE_KEY, &old_raw, &new_raw).await?;
    }
    Ok(())
}

pub async fn cancel(kv: &dyn KvStore, entry_id: &str, now: Timestamp) -> anyhow::Result<()> {
    let entries = list_entries(kv).await?;
    if let Some(entry) = entries.iter().find(|e| e.id == entry_id) {
        let raw = serde_json::to_string(entry)?;
        for id in &entry.allocated_ids {
            crate::kv::set_json(kv, &gpu_key(*id), &GpuRecord::Available { last_released: Some(now) }).await?;
        }
        kv.list_remove(QUEUE_KEY, &raw).await?;
    }
    Ok(())
}
