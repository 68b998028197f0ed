// src/cli/queue.rs -- `gpuhold queue` (spec.md §6.1, §4.2)

use super::Context;
use crate::queue as queue_mgr;
use serde_json::json;

pub async fn run(ctx: &Context, as_json: bool) -> anyhow::Result<i32> {
    ctx.engine.sweep().await?;
    let entries = queue_mgr::list_entries(ctx.kv.as_ref()).await?;
    let now = ctx.clock.now();

    if as_json {
        let rows: Vec<_> = entries
            .iter()
            .map(|e| {
                json!({
                    "id": e.id,
                    "user": e.user,
                    "requested": e.target_count(),
                    "allocated": e.allocated_ids,
                    "wait_s": now.since(e.enqueue_time).as_secs_f64(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(0);
    }

    if entries.is_empty() {
        println!("queue is empty");
        return Ok(0);
    }

    for e in &entries {
        println!(
            "{}: user={} requested={} allocated={:?} waiting={:.0}s",
            e.id,
            e.user,
            e.target_count(),
            e.allocated_ids,
            now.since(e.enqueue_time).as_secs_f64()
        );
    }
    Ok(0)
}
