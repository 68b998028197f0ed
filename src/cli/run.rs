// src/cli/run.rs -- `gpuhold run` (spec.md §6.1, §4.1, §4.4)

use super::{actual_user, owned_ids, parse_ids, wait_for_queue_result, Context};
use crate::duration::parse_duration;
use crate::error::GpuholdError;
use crate::state::{LeaseType, QueueEntry, ReserveRequest};
use std::time::Duration;
use uuid::Uuid;

pub struct RunArgs {
    pub gpus: Option<usize>,
    pub gpu_ids: Option<String>,
    pub timeout: Option<String>,
    pub nonblock: bool,
    pub wait: Option<String>,
    pub note: Option<String>,
    pub user: Option<String>,
    pub cmd: Vec<String>,
}

/// How long `run.rs` waits for the detached supervisor to confirm its own
/// bootstrap before proceeding to `exec` (spec_full.md §9 "readiness pipe").
const SUPERVISOR_READY_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn run(ctx: &Context, args: RunArgs) -> anyhow::Result<i32> {
    if args.cmd.is_empty() {
        anyhow::bail!("missing command: use `gpuhold run ... -- CMD...`");
    }

    let owner = actual_user()?;
    let display_user = args.user.unwrap_or_else(|| owner.clone());
    let ids = args.gpu_ids.as_deref().map(parse_ids).transpose()?;
    let kill_timeout = args.timeout.as_deref().map(parse_duration).transpose()?;

    ctx.engine.sweep().await?;
    let meta = match ctx.engine.pool_meta().await? {
        Some(m) => m,
        None => {
            eprintln!("error: {}", GpuholdError::NotInitialized);
            return Ok(1);
        }
    };
    let now = ctx.clock.now();

    let request = ReserveRequest {
        count: args.gpus,
        ids: ids.clone(),
        user: display_user.clone(),
        actual_user: owner.clone(),
        lease_type: LeaseType::Run,
        expiry_time: None,
        note: args.note.clone(),
        force: false,
    };

    let excludes = ctx.validator.unreserved_excludes(meta.gpu_count).await;

    let allocated = match ctx.engine.reserve(&request, &excludes).await {
        Ok(ids) => ids,
        Err(GpuholdError::InsufficientResources { requested, available, held, excluded }) => {
            if args.nonblock {
                eprintln!(
                    "error: insufficient resources: requested {requested}, available {available}, \
                     {held} held, {excluded} unreserved"
                );
                return Ok(1);
            }

            let wait_timeout = args.wait.as_deref().map(parse_duration).transpose()?;
            let before = owned_ids(ctx, &owner, meta.gpu_count).await?;
            let entry = QueueEntry {
                id: Uuid::new_v4().to_string(),
                user: display_user,
                actual_user: owner.clone(),
                requested_count: args.gpus,
                requested_ids: ids,
                allocated_ids: Vec::new(),
                lease_type: LeaseType::Run,
                expiry_or_timeout: wait_timeout.map(|d| now.checked_add(d)),
                lease_duration_secs: None,
                note: args.note,
                enqueue_time: now,
                client_heartbeat: now,
            };
            crate::queue::enqueue(ctx.kv.as_ref(), &entry).await?;
            log::info!("enqueued run request {} for {}", entry.id, entry.user);

            match wait_for_queue_result(ctx, entry, before, meta.gpu_count).await {
                Ok(ids) => ids,
                Err(e) => {
                    eprintln!("error: {e}");
                    return Ok(1);
                }
            }
        }
        Err(e) => return Err(e.into()),
    };

    let ids_csv = allocated.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",");
    log::info!("allocated gpu(s) {ids_csv} to {owner}, launching supervisor");

    let exe = std::env::current_exe()?;
    let ready_file = std::env::temp_dir().join(format!("gpuhold-ready-{}", Uuid::new_v4()));
    let user_pid = std::process::id();

    let _supervisor_child =
        crate::supervisor::spawn_detached(&exe, &allocated, &owner, user_pid, kill_timeout, &ready_file).map_err(
            |e| anyhow::anyhow!("failed to spawn supervisor (gpus {ids_csv} remain reserved, sweep will reclaim them): {e}"),
        )?;

    wait_for_readiness(&ready_file, SUPERVISOR_READY_TIMEOUT).await;
    let _ = std::fs::remove_file(&ready_file);

    std::env::set_var("CUDA_VISIBLE_DEVICES", &ids_csv);

    log::info!("exec'ing into user command: {:?}", args.cmd);
    let err = {
        use std::os::unix::process::CommandExt;
        std::process::Command::new(&args.cmd[0]).args(&args.cmd[1..]).exec()
    };
    // exec() only returns on failure -- the GPUs stay reserved and the
    // supervisor is still watching our pid, so they're released either when
    // we exit below or by the sweep after HEARTBEAT_TIMEOUT.
    Err(anyhow::anyhow!("failed to exec {:?}: {err}", args.cmd[0]))
}

async fn wait_for_readiness(path: &std::path::Path, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    log::warn!("supervisor readiness file never appeared after {timeout:?}; proceeding anyway");
}
