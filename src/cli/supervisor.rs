// src/cli/supervisor.rs -- `gpuhold supervisor` (hidden, spec.md §6.1, §4.4)
//
// Invoked only by `run`, already detached into its own session. Never logs
// to stderr: that fd does not survive the client's `exec` replacement.

use super::{parse_ids, Context};
use crate::supervisor::SupervisorArgs;
use std::time::Duration;

pub async fn run(
    ctx: &Context,
    gpus: String,
    user: String,
    pid: u32,
    timeout_secs: Option<u64>,
    ready_file: Option<String>,
) -> anyhow::Result<i32> {
    let gpu_ids = parse_ids(&gpus)?;

    crate::supervisor::run(
        ctx.engine.clone(),
        SupervisorArgs {
            gpu_ids,
            actual_user: user,
            user_pid: pid,
            timeout: timeout_secs.map(Duration::from_secs),
            heartbeat_interval: ctx.config.heartbeat_interval,
            ready_file: ready_file.map(std::path::PathBuf::from),
        },
    )
    .await?;

    Ok(0)
}
