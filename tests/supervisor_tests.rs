// tests/supervisor_tests.rs -- readiness handshake (spec.md §4.4, §9 "readiness pipe")

use gpuhold::kv::MemoryKv;
use gpuhold::supervisor::{spawn_detached, SupervisorArgs};
use gpuhold::time::{FixedClock, Timestamp};
use gpuhold::AllocationEngine;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn run_writes_the_readiness_file_before_entering_its_poll_loop() {
    let kv = Arc::new(MemoryKv::new());
    let clock = Arc::new(FixedClock::new(Timestamp::from_datetime(chrono::Utc::now())));
    let engine = Arc::new(AllocationEngine::new(kv, clock, Duration::from_secs(300)));

    let dir = tempfile::tempdir().unwrap();
    let ready_file = dir.path().join("ready");

    let args = SupervisorArgs {
        gpu_ids: vec![0],
        actual_user: "alice".to_string(),
        user_pid: std::process::id(),
        timeout: None,
        heartbeat_interval: Duration::from_secs(60),
        ready_file: Some(ready_file.clone()),
    };

    let handle = tokio::spawn(gpuhold::supervisor::run(engine, args));

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline && !ready_file.exists() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ready_file.exists(), "supervisor never wrote its readiness file");

    handle.abort();
}

#[test]
fn spawn_detached_builds_a_hidden_supervisor_invocation() {
    let dir = tempfile::tempdir().unwrap();
    let ready_file = dir.path().join("ready");
    let exe = std::env::current_exe().unwrap();

    let child = spawn_detached(&exe, &[0, 1], "alice", std::process::id(), Some(Duration::from_secs(5)), &ready_file);
    // The test binary isn't `gpuhold` itself, so the spawned process will
    // fail clap parsing almost immediately -- this only exercises that the
    // detached spawn call itself succeeds (setsid, arg wiring), not the
    // full supervisor lifecycle.
    let mut child = child.expect("spawn_detached should succeed even though the child will exit quickly");
    let _ = child.wait();
}
