// src/cli/reserve.rs -- `gpuhold reserve` (spec.md §6.1, §4.1, §4.2)

use super::{actual_user, owned_ids, parse_ids, wait_for_queue_result, Context};
use crate::duration::parse_duration;
use crate::error::GpuholdError;
use crate::state::{GpuId, LeaseType, QueueEntry, ReserveRequest};
use uuid::Uuid;

pub struct ReserveArgs {
    pub gpus: Option<usize>,
    pub gpu_ids: Option<String>,
    pub duration: String,
    pub force: bool,
    pub nonblock: bool,
    pub wait: Option<String>,
    pub note: Option<String>,
    pub user: Option<String>,
    pub short: bool,
}

pub async fn run(ctx: &Context, args: ReserveArgs) -> anyhow::Result<i32> {
    let owner = actual_user()?;
    let display_user = args.user.unwrap_or_else(|| owner.clone());
    let ids = args.gpu_ids.as_deref().map(parse_ids).transpose()?;
    let duration = parse_duration(&args.duration)?;

    ctx.engine.sweep().await?;
    let meta = match ctx.engine.pool_meta().await? {
        Some(m) => m,
        None => {
            eprintln!("error: {}", GpuholdError::NotInitialized);
            return Ok(1);
        }
    };
    let now = ctx.clock.now();
    let expiry_time = now.checked_add(duration);

    let request = ReserveRequest {
        count: args.gpus,
        ids: ids.clone(),
        user: display_user.clone(),
        actual_user: owner.clone(),
        lease_type: LeaseType::Manual,
        expiry_time: Some(expiry_time),
        note: args.note.clone(),
        force: args.force,
    };

    let excludes = ctx.validator.unreserved_excludes(meta.gpu_count).await;

    match ctx.engine.reserve(&request, &excludes).await {
        Ok(allocated) => {
            print_allocated(&allocated, args.short);
            return Ok(0);
        }
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
                actual_user: owner,
                requested_count: args.gpus,
                requested_ids: ids,
                allocated_ids: Vec::new(),
                lease_type: LeaseType::Manual,
                expiry_or_timeout: wait_timeout.map(|d| now.checked_add(d)),
                lease_duration_secs: Some(duration.as_secs_f64()),
                note: args.note,
                enqueue_time: now,
                client_heartbeat: now,
            };
            crate::queue::enqueue(ctx.kv.as_ref(), &entry).await?;
            log::info!("enqueued reservation request {} for {}", entry.id, entry.user);

            match wait_for_queue_result(ctx, entry, before, meta.gpu_count).await {
                Ok(allocated) => {
                    print_allocated(&allocated, args.short);
                    Ok(0)
                }
                Err(e) => {
                    eprintln!("error: {e}");
                    Ok(1)
                }
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn print_allocated(ids: &[GpuId], short: bool) {
    let joined = ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",");
    if short {
        println!("{joined}");
    } else {
        println!("reserved gpu(s): {joined}");
    }
}
