// src/cli/release.rs -- `gpuhold release` (spec.md §6.1, §4.1)

use super::{actual_user, parse_ids, Context};

pub async fn run(ctx: &Context, gpu_ids: Option<String>) -> anyhow::Result<i32> {
    let user = actual_user()?;

    let outcome = match gpu_ids {
        Some(raw) => {
            let ids = parse_ids(&raw)?;
            ctx.engine.release_specific(&user, &ids).await?
        }
        None => {
            let released = ctx.engine.release_all(&user).await?;
            crate::engine::ReleaseOutcome { released, skipped: Vec::new() }
        }
    };

    if !outcome.released.is_empty() {
        println!("released: {}", join_ids(&outcome.released));
    }
    if !outcome.skipped.is_empty() {
        // Silent-skip per spec.md §7/§9 open question: not owned by this
        // user, reported but not treated as an error.
        eprintln!("skipped (not owned by {user}): {}", join_ids(&outcome.skipped));
    }
    if outcome.released.is_empty() && outcome.skipped.is_empty() {
        println!("nothing to release");
    }

    Ok(0)
}

fn join_ids(ids: &[crate::state::GpuId]) -> String {
    ids.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(",")
}
