// tests/queue_tests.rs -- FCFS queue behavior, partial fill, timeout reaping
// (spec.md §4.2, §8 scenario 5)

use gpuhold::kv::{get_json, set_json, MemoryKv};
use gpuhold::state::{GpuId, LeaseType, QueueEntry};
use gpuhold::time::Timestamp;
use std::time::Duration;

fn now() -> Timestamp {
    Timestamp::from_datetime(chrono::Utc::now())
}

fn entry(id: &str, user: &str, count: usize, enqueue_time: Timestamp) -> QueueEntry {
    QueueEntry {
        id: id.to_string(),
        user: user.to_string(),
        actual_user: user.to_string(),
        requested_count: Some(count),
        requested_ids: None,
        allocated_ids: Vec::new(),
        lease_type: LeaseType::Manual,
        expiry_or_timeout: None,
        lease_duration_secs: None,
        note: None,
        enqueue_time,
        client_heartbeat: enqueue_time,
    }
}

#[tokio::test]
async fn fcfs_head_gets_first_claim_on_released_gpus() {
    let kv = MemoryKv::new();
    let t0 = now();

    gpuhold::queue::enqueue(&kv, &entry("e1", "alice", 1, t0)).await.unwrap();
    gpuhold::queue::enqueue(&kv, &entry("e2", "bob", 1, t0)).await.unwrap();

    let freed: Vec<GpuId> = vec![3];
    gpuhold::queue::try_fill_head(&kv, &freed, t0).await.unwrap();

    let entries = gpuhold::queue::list_entries(&kv).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, "e2");
    assert_eq!(entries[0].user, "bob");
}

#[tokio::test]
async fn partial_fill_keeps_head_in_place_until_complete() {
    let kv = MemoryKv::new();
    let t0 = now();

    gpuhold::queue::enqueue(&kv, &entry("e1", "alice", 2, t0)).await.unwrap();
    gpuhold::queue::enqueue(&kv, &entry("e2", "bob", 1, t0)).await.unwrap();

    gpuhold::queue::try_fill_head(&kv, &[5], t0).await.unwrap();
    let mid = gpuhold::queue::list_entries(&kv).await.unwrap();
    assert_eq!(mid.len(), 2, "head is still partial, bob must not be served yet");
    assert_eq!(mid[0].allocated_ids, vec![5]);

    gpuhold::queue::try_fill_head(&kv, &[6], t0).await.unwrap();
    let done = gpuhold::queue::list_entries(&kv).await.unwrap();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].id, "e2");
}

#[tokio::test]
async fn granted_manual_entry_gets_expiry_from_requested_duration_not_wait_deadline() {
    let kv = MemoryKv::new();
    let t0 = now();

    let mut waiter = entry("e1", "alice", 1, t0);
    // A short wait deadline (the client gave up waiting this soon) must not
    // leak into the eventual lease's expiry once it's granted.
    waiter.expiry_or_timeout = Some(t0.checked_add(Duration::from_secs(30)));
    waiter.lease_duration_secs = Some(Duration::from_secs(3600).as_secs_f64());
    gpuhold::queue::enqueue(&kv, &waiter).await.unwrap();

    gpuhold::queue::try_fill_head(&kv, &[0], t0).await.unwrap();

    let record: gpuhold::state::GpuRecord = get_json(&kv, &gpuhold::state::gpu_key(0)).await.unwrap().unwrap();
    match record {
        gpuhold::state::GpuRecord::Reserved { expiry_time, .. } => {
            let expiry = expiry_time.expect("granted manual lease must carry an expiry");
            assert_eq!(expiry.since(t0), Duration::from_secs(3600));
        }
        other => panic!("expected Reserved, got {other:?}"),
    }
}

#[tokio::test]
async fn idle_wait_timeout_is_reaped_without_a_release_event() {
    let kv = MemoryKv::new();
    let t0 = now();

    let mut waiter = entry("e1", "alice", 1, t0);
    waiter.expiry_or_timeout = Some(t0.checked_add(Duration::from_secs(5)));
    gpuhold::queue::enqueue(&kv, &waiter).await.unwrap();

    let later = Timestamp::from_datetime(t0.inner() + chrono::Duration::seconds(10));

    // No GPU was released; reap_expired must still fire the timeout.
    let freed = gpuhold::queue::reap_expired(&kv, later).await.unwrap();
    assert!(freed.is_empty(), "nothing was allocated to this waiter yet");

    let entries = gpuhold::queue::list_entries(&kv).await.unwrap();
    assert!(entries.is_empty(), "timed-out waiter must be dropped from the queue");
}

#[tokio::test]
async fn dead_client_is_reaped_and_partial_allocation_released() {
    let kv = MemoryKv::new();
    let t0 = now();

    let mut waiter = entry("e1", "alice", 2, t0);
    waiter.allocated_ids = vec![1];
    gpuhold::queue::enqueue(&kv, &waiter).await.unwrap();
    set_json(
        &kv,
        &gpuhold::state::gpu_key(1),
        &gpuhold::state::GpuRecord::Reserved {
            user: "alice".into(),
            actual_user: "alice".into(),
            start_time: t0,
            lease_type: LeaseType::Manual,
            note: None,
            last_heartbeat: None,
            expiry_time: None,
        },
    )
    .await
    .unwrap();

    let stale = Timestamp::from_datetime(t0.inner() + chrono::Duration::seconds(20));
    let freed = gpuhold::queue::reap_expired(&kv, stale).await.unwrap();
    assert_eq!(freed, vec![1]);

    let entries = gpuhold::queue::list_entries(&kv).await.unwrap();
    assert!(entries.is_empty());

    let record: gpuhold::state::GpuRecord = get_json(&kv, &gpuhold::state::gpu_key(1)).await.unwrap().unwrap();
    assert!(!record.is_reserved());
}

#[tokio::test]
async fn cancel_releases_partial_allocation_and_drops_entry() {
    let kv = MemoryKv::new();
    let t0 = now();

    let mut waiter = entry("e1", "alice", 2, t0);
    waiter.allocated_ids = vec![2];
    gpuhold::queue::enqueue(&kv, &waiter).await.unwrap();

    gpuhold::queue::cancel(&kv, "e1", t0).await.unwrap();
    let entries = gpuhold::queue::list_entries(&kv).await.unwrap();
    assert!(entries.is_empty());
}
