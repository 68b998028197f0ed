// src/cli/status.rs -- `gpuhold status` (spec.md §6.1, §4.5, §4.6)

use super::Context;
use crate::validator::{GpuStatus, LeaseDetail};
use serde_json::json;

pub async fn run(
    ctx: &Context,
    as_json: bool,
    summary: bool,
    remote: Option<String>,
    all: bool,
) -> anyhow::Result<i32> {
    if remote.is_some() || all {
        anyhow::bail!("remote/multi-host status is out of scope for a single-host coordinator");
    }

    ctx.engine.sweep().await?;

    let meta = match ctx.engine.pool_meta().await? {
        Some(m) => m,
        None => {
            eprintln!("error: {}", crate::error::GpuholdError::NotInitialized);
            return Ok(1);
        }
    };

    let rows = ctx.validator.status(meta.gpu_count).await;

    if as_json {
        let entries: Vec<_> = rows
            .iter()
            .map(|(id, status)| json!({ "gpu_id": id, "status": status_json(status) }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(0);
    }

    if summary {
        let (mut available, mut in_use, mut unreserved, mut errored) = (0, 0, 0, 0);
        for (_, status) in &rows {
            match status {
                GpuStatus::Available { .. } => available += 1,
                GpuStatus::InUse { .. } => in_use += 1,
                GpuStatus::Unreserved { .. } => unreserved += 1,
                GpuStatus::Error { .. } => errored += 1,
            }
        }
        println!(
            "{} available, {} in use, {} unreserved, {} error (of {})",
            available, in_use, unreserved, errored, meta.gpu_count
        );
        return Ok(0);
    }

    for (id, status) in &rows {
        match status {
            GpuStatus::Available { last_released, memory_mb_used } => println!(
                "gpu {id}: available (last_released={}, mem_used={memory_mb_used}MB)",
                last_released.map(|t| t.inner().to_rfc3339()).unwrap_or_else(|| "never".into())
            ),
            GpuStatus::InUse { user, lease_kind, start_time, duration_s, detail } => {
                let detail_str = match detail {
                    LeaseDetail::Heartbeat(hb) => format!("last_heartbeat={}", hb.inner().to_rfc3339()),
                    LeaseDetail::Expiry(exp) => format!("expiry={}", exp.inner().to_rfc3339()),
                };
                println!(
                    "gpu {id}: in_use user={user} type={lease_kind} start={} duration={:.0}s {detail_str}",
                    start_time.inner().to_rfc3339(),
                    duration_s
                );
            }
            GpuStatus::Unreserved { users, processes, memory_mb_used } => println!(
                "gpu {id}: UNRESERVED users={:?} processes={} mem_used={memory_mb_used}MB",
                users,
                processes.len()
            ),
            GpuStatus::Error { .. } => println!("gpu {id}: ERROR (record could not be parsed)"),
        }
    }

    Ok(0)
}

fn status_json(status: &GpuStatus) -> serde_json::Value {
    match status {
        GpuStatus::Available { last_released, memory_mb_used } => json!({
            "state": "available",
            "last_released": last_released.map(|t| t.inner().to_rfc3339()),
            "memory_mb_used": memory_mb_used,
        }),
        GpuStatus::InUse { user, lease_kind, start_time, duration_s, detail } => {
            let mut obj = json!({
                "state": "in_use",
                "user": user,
                "type": lease_kind,
                "start_time": start_time.inner().to_rfc3339(),
                "duration_s": duration_s,
            });
            match detail {
                LeaseDetail::Heartbeat(hb) => {
                    obj["last_heartbeat"] = json!(hb.inner().to_rfc3339());
                }
                LeaseDetail::Expiry(exp) => {
                    obj["expiry_time"] = json!(exp.inner().to_rfc3339());
                }
            }
            obj
        }
        GpuStatus::Unreserved { users, processes, memory_mb_used } => json!({
            "state": "unreserved",
            "users": users,
            "processes": processes.iter().map(|(pid, name, mem)| json!({
                "pid": pid, "process_name": name, "memory_mb": mem,
            })).collect::<Vec<_>>(),
            "memory_mb_used": memory_mb_used,
        }),
        GpuStatus::Error { gpu_id } => json!({ "state": "error", "gpu_id": gpu_id }),
    }
}
