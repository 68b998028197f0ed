// src/supervisor.rs
//
// =============================================================================
// GPUHOLD: SUPERVISOR (spec.md §4.4, spec_full.md §9)
// =============================================================================
//
// A detached helper that outlives the client's exec into the user's
// command. Starts the heartbeat manager for the lease, polls the user PID
// for liveness, and on a requested timeout signals the whole process group
// (interrupt, then kill after a grace period). Even if this process itself
// crashes, the sweep reclaims the GPUs after HEARTBEAT_TIMEOUT -- this is
// an optimization for timely release, not the correctness mechanism.

use crate::config::{SUPERVISOR_KILL_GRACE, SUPERVISOR_POLL_INTERVAL};
use crate::engine::AllocationEngine;
use crate::heartbeat::HeartbeatManager;
use crate::state::GpuId;
use crate::time::{Clock, SystemClock, Timestamp};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::sync::Arc;
use std::time::Duration;

pub struct SupervisorArgs {
    pub gpu_ids: Vec<GpuId>,
    pub actual_user: String,
    pub user_pid: u32,
    pub timeout: Option<Duration>,
    pub heartbeat_interval: Duration,
    pub ready_file: Option<std::path::PathBuf>,
}

/// Signal 0: a liveness probe that delivers nothing (spec.md §4.4 step 2).
fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Delivers a signal to the whole process group so that worker processes
/// spawned by the user's command (common for ML workloads) are reached too,
/// not just the leader PID (spec.md §5).
fn signal_group(pid: u32, sig: Signal) {
    // A negative pid argument to kill(2) targets the process group;
    // nix's killpg does the same thing with a clearer name.
    if let Err(e) = signal::killpg(Pid::from_raw(pid as i32), sig) {
        log::warn!("failed to deliver {sig:?} to process group of pid {pid}: {e}");
    }
}

pub async fn run(engine: Arc<AllocationEngine>, args: SupervisorArgs) -> anyhow::Result<()> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let start_time: Timestamp = clock.now();

    let heartbeat = HeartbeatManager::spawn(
        engine.clone(),
        args.actual_user.clone(),
        start_time,
        args.gpu_ids.clone(),
        args.heartbeat_interval,
    );

    log::info!(
        "supervisor active for pid={} user={} gpus={:?}",
        args.user_pid,
        args.actual_user,
        args.gpu_ids
    );

    // Signal the client that launched us that our heartbeat is live, so it
    // can safely `exec` into the user's command (spec_full.md §9, spec.md §9
    // "the requirement is that killing the client does not kill the
    // supervisor" -- it must not race ahead of us starting, either).
    if let Some(path) = &args.ready_file {
        if let Err(e) = tokio::fs::write(path, b"ready").await {
            log::warn!("failed to write supervisor readiness file {path:?}: {e}");
        }
    }

    let deadline = args.timeout.map(|t| std::time::Instant::now() + t);
    let mut timeout_fired = false;

    loop {
        tokio::time::sleep(SUPERVISOR_POLL_INTERVAL).await;

        if !pid_is_alive(args.user_pid) {
            log::info!("user process {} exited; stopping heartbeat", args.user_pid);
            break;
        }

        if !timeout_fired {
            if let Some(deadline) = deadline {
                if std::time::Instant::now() >= deadline {
                    timeout_fired = true;
                    log::warn!(
                        "timeout reached for pid {}; sending SIGINT to process group",
                        args.user_pid
                    );
                    signal_group(args.user_pid, Signal::SIGINT);

                    let grace_deadline = std::time::Instant::now() + SUPERVISOR_KILL_GRACE;
                    loop {
                        tokio::time::sleep(SUPERVISOR_POLL_INTERVAL).await;
                        if !pid_is_alive(args.user_pid) {
                            break;
                        }
                        if std::time::Instant::now() >= grace_deadline {
                            log::warn!(
                                "pid {} still alive after {:?} grace period; sending SIGKILL",
                                args.user_pid,
                                SUPERVISOR_KILL_GRACE
                            );
                            signal_group(args.user_pid, Signal::SIGKILL);
                            break;
                        }
                    }
                    break;
                }
            }
        }
    }

    heartbeat.stop().await;
    Ok(())
}

/// Spawns this binary as a detached `supervisor` subprocess, in a new
/// session so it survives the client's own exit/exec-replacement (spec.md
/// §5 "process boundary", spec_full.md §9).
pub fn spawn_detached(
    exe: &std::path::Path,
    gpu_ids: &[GpuId],
    actual_user: &str,
    user_pid: u32,
    timeout: Option<Duration>,
    ready_file: &std::path::Path,
) -> anyhow::Result<std::process::Child> {
    use std::os::unix::process::CommandExt;

    let ids_csv = gpu_ids
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(",");

    let mut cmd = std::process::Command::new(exe);
    cmd.arg("supervisor")
        .arg("--gpus")
        .arg(ids_csv)
        .arg("--user")
        .arg(actual_user)
        .arg("--pid")
        .arg(user_pid.to_string())
        .arg("--ready-file")
        .arg(ready_file);
    if let Some(t) = timeout {
        cmd.arg("--timeout-secs").arg(t.as_secs().to_string());
    }

    cmd.stdin(std::process::Stdio::null());
    // process_group(0) detaches into a new session/group so killing the
    // client's terminal or parent shell does not take the supervisor with it.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    cmd.spawn().map_err(Into::into)
}
