// tests/engine_tests.rs -- allocation engine invariants (spec.md §8)

use gpuhold::kv::MemoryKv;
use gpuhold::state::{GpuRecord, LeaseType, Provider, ReserveRequest};
use gpuhold::time::{Clock, FixedClock, Timestamp};
use gpuhold::AllocationEngine;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn request(user: &str, count: usize, lease_type: LeaseType) -> ReserveRequest {
    ReserveRequest {
        count: Some(count),
        ids: None,
        user: user.to_string(),
        actual_user: user.to_string(),
        lease_type,
        expiry_time: None,
        note: None,
        force: false,
    }
}

fn harness() -> (Arc<AllocationEngine>, Arc<FixedClock>) {
    let kv = Arc::new(MemoryKv::new());
    let clock = Arc::new(FixedClock::new(Timestamp::from_datetime(chrono::Utc::now())));
    let engine = Arc::new(AllocationEngine::new(kv, clock.clone(), Duration::from_secs(300)));
    (engine, clock)
}

#[tokio::test]
async fn no_double_ownership_on_concurrent_reserve() {
    let (engine, _clock) = harness();
    engine.init_pool(4, Provider::Fake, false).await.unwrap();

    let a = request("alice", 2, LeaseType::Manual);
    let b = request("bob", 2, LeaseType::Manual);

    let a_ids = engine.reserve(&a, &HashSet::new()).await.unwrap();
    let b_ids = engine.reserve(&b, &HashSet::new()).await.unwrap();

    assert_eq!(a_ids.len(), 2);
    assert_eq!(b_ids.len(), 2);
    assert!(a_ids.iter().all(|id| !b_ids.contains(id)));
}

#[tokio::test]
async fn cannot_reserve_past_pool_capacity() {
    let (engine, _clock) = harness();
    engine.init_pool(2, Provider::Fake, false).await.unwrap();

    let a = request("alice", 2, LeaseType::Manual);
    engine.reserve(&a, &HashSet::new()).await.unwrap();

    let b = request("bob", 1, LeaseType::Manual);
    let err = engine.reserve(&b, &HashSet::new()).await.unwrap_err();
    match err {
        gpuhold::GpuholdError::InsufficientResources { requested, available, .. } => {
            assert_eq!(requested, 1);
            assert_eq!(available, 0);
        }
        other => panic!("expected InsufficientResources, got {other:?}"),
    }
}

#[tokio::test]
async fn release_does_not_steal_another_users_gpu() {
    let (engine, _clock) = harness();
    engine.init_pool(2, Provider::Fake, false).await.unwrap();

    let a = request("alice", 1, LeaseType::Manual);
    let ids = engine.reserve(&a, &HashSet::new()).await.unwrap();

    let outcome = engine.release_specific("bob", &ids).await.unwrap();
    assert!(outcome.released.is_empty());
    assert_eq!(outcome.skipped, ids);

    let record = engine.record(ids[0]).await.unwrap();
    assert!(record.is_reserved());
}

#[tokio::test]
async fn sweep_is_idempotent() {
    let (engine, clock) = harness();
    engine.init_pool(1, Provider::Fake, false).await.unwrap();

    let req = ReserveRequest {
        expiry_time: Some(clock.now().checked_add(Duration::from_secs(10))),
        ..request("alice", 1, LeaseType::Manual)
    };
    let ids = engine.reserve(&req, &HashSet::new()).await.unwrap();

    clock.advance(Duration::from_secs(20));
    let freed_first = engine.sweep().await.unwrap();
    assert_eq!(freed_first, ids);

    let freed_second = engine.sweep().await.unwrap();
    assert!(freed_second.is_empty());

    let record = engine.record(ids[0]).await.unwrap();
    assert!(matches!(record, GpuRecord::Available { .. }));
}

#[tokio::test]
async fn sweep_reaps_stale_run_lease_by_heartbeat() {
    let (engine, clock) = harness();
    engine.init_pool(1, Provider::Fake, false).await.unwrap();

    let ids = engine.reserve(&request("alice", 1, LeaseType::Run), &HashSet::new()).await.unwrap();
    let start = clock.now();
    assert!(engine.tick_heartbeat(ids[0], "alice", start).await.unwrap());

    clock.advance(Duration::from_secs(301));
    let freed = engine.sweep().await.unwrap();
    assert_eq!(freed, ids);
}

#[tokio::test]
async fn mru_prefers_users_own_recently_released_gpu() {
    let (engine, clock) = harness();
    engine.init_pool(3, Provider::Fake, false).await.unwrap();

    // alice uses gpu 1, releases it; then requests 1 gpu again and should get it back.
    let first = ReserveRequest { ids: Some(vec![1]), ..request("alice", 1, LeaseType::Manual) };
    engine.reserve(&first, &HashSet::new()).await.unwrap();
    clock.advance(Duration::from_secs(5));
    engine.release_all("alice").await.unwrap();

    clock.advance(Duration::from_secs(5));
    let second = engine.reserve(&request("alice", 1, LeaseType::Manual), &HashSet::new()).await.unwrap();
    assert_eq!(second, vec![1]);
}

#[tokio::test]
async fn unreserved_excludes_are_skipped_unless_forced() {
    let (engine, _clock) = harness();
    engine.init_pool(1, Provider::Fake, false).await.unwrap();

    let mut excludes = HashSet::new();
    excludes.insert(0u32);

    let blocked = engine.reserve(&request("alice", 1, LeaseType::Manual), &excludes).await;
    assert!(blocked.is_err());

    let forced = ReserveRequest { force: true, ..request("alice", 1, LeaseType::Manual) };
    let ids = engine.reserve(&forced, &excludes).await.unwrap();
    assert_eq!(ids, vec![0]);
}

#[tokio::test]
async fn release_all_only_touches_manual_leases() {
    let (engine, _clock) = harness();
    engine.init_pool(2, Provider::Fake, false).await.unwrap();

    let manual = engine.reserve(&request("alice", 1, LeaseType::Manual), &HashSet::new()).await.unwrap();
    let run = engine.reserve(&request("alice", 1, LeaseType::Run), &HashSet::new()).await.unwrap();

    let released = engine.release_all("alice").await.unwrap();
    assert_eq!(released, manual);

    let run_record = engine.record(run[0]).await.unwrap();
    assert!(run_record.is_reserved());
}
