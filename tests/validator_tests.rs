// tests/validator_tests.rs -- unreserved-exclusion and status assembly
// (spec.md §4.5, §4.6)

use gpuhold::kv::MemoryKv;
use gpuhold::probe::{FakeProvider, GpuUsage};
use gpuhold::state::{LeaseType, Provider, ReserveRequest};
use gpuhold::time::{FixedClock, Timestamp};
use gpuhold::validator::GpuStatus;
use gpuhold::{AllocationEngine, Validator};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

const MEMORY_THRESHOLD_MB: u64 = 512;

fn harness() -> (Arc<AllocationEngine>, Arc<FakeProvider>, Arc<Validator>) {
    let kv = Arc::new(MemoryKv::new());
    let clock = Arc::new(FixedClock::new(Timestamp::from_datetime(chrono::Utc::now())));
    let engine = Arc::new(AllocationEngine::new(kv, clock.clone(), Duration::from_secs(300)));
    let provider = Arc::new(FakeProvider::new());
    let validator = Arc::new(Validator::new(
        engine.clone(),
        provider.clone(),
        clock.clone(),
        MEMORY_THRESHOLD_MB,
    ));
    (engine, provider, validator)
}

#[tokio::test]
async fn busy_unreserved_gpu_is_excluded_from_allocation() {
    let (engine, provider, validator) = harness();
    engine.init_pool(2, Provider::Fake, false).await.unwrap();

    provider.set(0, GpuUsage { memory_mb_total_used: 4096, processes: Vec::new() });

    let excludes = validator.unreserved_excludes(2).await;
    assert!(excludes.contains(&0));
    assert!(!excludes.contains(&1));

    let request = ReserveRequest {
        count: Some(1),
        ids: Some(vec![0]),
        user: "alice".into(),
        actual_user: "alice".into(),
        lease_type: LeaseType::Manual,
        expiry_time: None,
        note: None,
        force: false,
    };
    assert!(engine.reserve(&request, &excludes).await.is_err());
}

#[tokio::test]
async fn reserved_gpu_is_never_unreserved_excluded_even_if_busy() {
    let (engine, provider, validator) = harness();
    engine.init_pool(1, Provider::Fake, false).await.unwrap();

    let request = ReserveRequest {
        count: Some(1),
        ids: None,
        user: "alice".into(),
        actual_user: "alice".into(),
        lease_type: LeaseType::Manual,
        expiry_time: None,
        note: None,
        force: false,
    };
    engine.reserve(&request, &HashSet::new()).await.unwrap();

    provider.set(0, GpuUsage { memory_mb_total_used: 99999, processes: Vec::new() });
    let excludes = validator.unreserved_excludes(1).await;
    assert!(excludes.is_empty(), "a reservation record always wins over raw memory usage");
}

#[tokio::test]
async fn status_reports_in_use_for_reserved_gpu() {
    let (engine, _provider, validator) = harness();
    engine.init_pool(1, Provider::Fake, false).await.unwrap();

    let request = ReserveRequest {
        count: Some(1),
        ids: None,
        user: "alice".into(),
        actual_user: "alice".into(),
        lease_type: LeaseType::Manual,
        expiry_time: None,
        note: Some("training run".into()),
        force: false,
    };
    engine.reserve(&request, &HashSet::new()).await.unwrap();

    let statuses = validator.status(1).await;
    assert_eq!(statuses.len(), 1);
    match &statuses[0].1 {
        GpuStatus::InUse { user, lease_kind, .. } => {
            assert_eq!(user, "alice");
            assert_eq!(*lease_kind, "manual");
        }
        other => panic!("expected InUse, got {other:?}"),
    }
}

#[tokio::test]
async fn status_reports_resolved_os_usernames_for_busy_free_gpu() {
    let (engine, provider, validator) = harness();
    engine.init_pool(1, Provider::Fake, false).await.unwrap();
    // Use this test process's own pid so `/proc/<pid>/status` resolves for
    // real -- there's no injectable username resolver to mock out.
    let pid = std::process::id();
    provider.set(
        0,
        GpuUsage {
            memory_mb_total_used: 4096,
            processes: vec![gpuhold::probe::GpuProcessUsage { pid, process_name: "train.py".into(), memory_mb: 4096 }],
        },
    );

    let expected_user = gpuhold::probe::resolve_username(pid).await;

    let statuses = validator.status(1).await;
    match &statuses[0].1 {
        GpuStatus::Unreserved { users, .. } => {
            assert_eq!(users, &vec![expected_user], "status must report the OS username, not the process name");
        }
        other => panic!("expected Unreserved, got {other:?}"),
    }
}
