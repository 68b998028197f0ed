// src/cli/mod.rs
//
// =============================================================================
// GPUHOLD: CLI SURFACE (spec.md §6.1)
// =============================================================================
//
// Behavioural contract only -- naming is incidental per spec.md. Defined as
// a clap derive Cli/Commands pair rather than a builder-style parser.

pub mod admin;
pub mod release;
pub mod reserve;
pub mod run;
pub mod status;
pub mod supervisor;

mod queue;

use crate::config::Config;
use crate::engine::AllocationEngine;
use crate::kv::KvStore;
use crate::probe::GpuProvider;
use crate::time::Clock;
use crate::validator::Validator;
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "gpuhold", version, about = "Single-host GPU reservation coordinator")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize or reinitialize the GPU pool.
    Admin {
        #[arg(long)]
        gpus: u32,
        #[arg(long)]
        force: bool,
        #[arg(long, value_enum, default_value = "nvidia")]
        provider: ProviderArg,
    },

    /// Read-only pool status; runs the sweep first.
    Status {
        #[arg(long)]
        json: bool,
        #[arg(long)]
        summary: bool,
        #[arg(long)]
        remote: Option<String>,
        #[arg(long)]
        all: bool,
    },

    /// Allocate GPUs, spawn a supervisor, and run a command under them.
    Run {
        #[arg(long, conflicts_with = "gpu_ids")]
        gpus: Option<usize>,
        #[arg(long = "gpu-ids", conflicts_with = "gpus")]
        gpu_ids: Option<String>,
        #[arg(long)]
        timeout: Option<String>,
        #[arg(long, conflicts_with = "wait")]
        nonblock: bool,
        #[arg(long, conflicts_with = "nonblock")]
        wait: Option<String>,
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        user: Option<String>,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        cmd: Vec<String>,
    },

    /// Create a time-bounded manual reservation.
    Reserve {
        #[arg(long, conflicts_with = "gpu_ids")]
        gpus: Option<usize>,
        #[arg(long = "gpu-ids", conflicts_with = "gpus")]
        gpu_ids: Option<String>,
        #[arg(long, default_value = "")]
        duration: String,
        #[arg(long)]
        force: bool,
        #[arg(long, conflicts_with = "wait")]
        nonblock: bool,
        #[arg(long, conflicts_with = "nonblock")]
        wait: Option<String>,
        #[arg(long)]
        note: Option<String>,
        #[arg(long)]
        user: Option<String>,
        /// Print only comma-joined ids, for scripting.
        #[arg(long)]
        short: bool,
    },

    /// Release held GPUs.
    Release {
        #[arg(long = "gpu-ids")]
        gpu_ids: Option<String>,
    },

    /// List current waiters.
    Queue {
        #[arg(long)]
        json: bool,
    },

    /// Detached helper coupling a lease to a monitored PID (internal use).
    #[command(hide = true)]
    Supervisor {
        #[arg(long = "gpus")]
        gpus: String,
        #[arg(long)]
        user: String,
        #[arg(long)]
        pid: u32,
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
        #[arg(long = "ready-file")]
        ready_file: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum ProviderArg {
    Nvidia,
    Amd,
    Fake,
}

impl From<ProviderArg> for crate::state::Provider {
    fn from(p: ProviderArg) -> Self {
        match p {
            ProviderArg::Nvidia => crate::state::Provider::Nvidia,
            ProviderArg::Amd => crate::state::Provider::Amd,
            ProviderArg::Fake => crate::state::Provider::Fake,
        }
    }
}

/// The wired-up subsystems every subcommand handler needs. Built once in
/// `main.rs` and threaded through by reference -- no process-wide singletons
/// other than this handle (spec_full.md §9, "global mutable state").
pub struct Context {
    pub engine: Arc<AllocationEngine>,
    pub validator: Arc<Validator>,
    pub provider: Arc<dyn GpuProvider>,
    pub kv: Arc<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    pub config: Config,
}

pub async fn dispatch(cli: Cli, ctx: Context) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Admin { gpus, force, provider } => admin::run(&ctx, gpus, force, provider).await,
        Commands::Status { json, summary, remote, all } => {
            status::run(&ctx, json, summary, remote, all).await
        }
        Commands::Run { gpus, gpu_ids, timeout, nonblock, wait, note, user, cmd } => {
            run::run(&ctx, run::RunArgs { gpus, gpu_ids, timeout, nonblock, wait, note, user, cmd }).await
        }
        Commands::Reserve { gpus, gpu_ids, duration, force, nonblock, wait, note, user, short } => {
            reserve::run(
                &ctx,
                reserve::ReserveArgs { gpus, gpu_ids, duration, force, nonblock, wait, note, user, short },
            )
            .await
        }
        Commands::Release { gpu_ids } => release::run(&ctx, gpu_ids).await,
        Commands::Queue { json } => queue::run(&ctx, json).await,
        Commands::Supervisor { gpus, user, pid, timeout_secs, ready_file } => {
            supervisor::run(&ctx, gpus, user, pid, timeout_secs, ready_file).await
        }
    }
}

/// Parses a comma-joined id list, e.g. `"0,1,3"`.
pub fn parse_ids(raw: &str) -> anyhow::Result<Vec<crate::state::GpuId>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<crate::state::GpuId>().map_err(|e| anyhow::anyhow!("invalid gpu id {s:?}: {e}")))
        .collect()
}

/// The OS-authenticated identity; `--user` supplies a display label only.
pub fn actual_user() -> anyhow::Result<String> {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .map_err(|_| anyhow::anyhow!("could not determine OS user (USER/LOGNAME unset)"))
}

/// Builds the probe implementation matching a `Provider` kind -- shared by
/// `admin` (choosing the pool's provider) and `main.rs` (reloading the
/// cached provider for every other command).
pub fn build_provider(kind: crate::state::Provider) -> Arc<dyn GpuProvider> {
    match kind {
        crate::state::Provider::Nvidia => Arc::new(crate::probe::NvidiaProvider),
        crate::state::Provider::Amd => Arc::new(crate::probe::AmdProvider),
        crate::state::Provider::Fake => Arc::new(crate::probe::FakeProvider::new()),
    }
}

/// Snapshot of GPU ids currently reservation-held by `actual_user`, used to
/// tell a queue grant apart from a pre-existing lease when reconciling.
pub async fn owned_ids(
    ctx: &Context,
    actual_user: &str,
    gpu_count: u32,
) -> anyhow::Result<std::collections::HashSet<crate::state::GpuId>> {
    let mut owned = std::collections::HashSet::new();
    for id in 0..gpu_count {
        if let crate::state::GpuRecord::Reserved { actual_user: owner, .. } = ctx.engine.record(id).await? {
            if owner == actual_user {
                owned.insert(id);
            }
        }
    }
    Ok(owned)
}

/// Polls a queue entry to completion. There is no notification primitive in
/// the KV store's surface (spec.md §5 "poll every ~1s"), so this resolves
/// the entry's eventual fate by re-checking whether it's still in the queue:
/// gone + the ids it targeted are now reservation-held by us means it was
/// filled; gone otherwise means it was reaped (dead client or timeout).
/// `before_owned` is a snapshot of ids this user already held prior to
/// enqueueing, excluded so a pre-existing reservation isn't mistaken for the
/// queue's grant.
pub async fn wait_for_queue_result(
    ctx: &Context,
    entry: crate::state::QueueEntry,
    before_owned: std::collections::HashSet<crate::state::GpuId>,
    gpu_count: u32,
) -> anyhow::Result<Vec<crate::state::GpuId>> {
    use crate::config::QUEUE_POLL_INTERVAL;

    let target = entry.target_count();

    loop {
        tokio::time::sleep(QUEUE_POLL_INTERVAL).await;
        ctx.engine.sweep().await?;

        let now = ctx.clock.now();
        crate::queue::refresh_client_heartbeat(ctx.kv.as_ref(), &entry.id, now).await?;

        let entries = crate::queue::list_entries(ctx.kv.as_ref()).await?;
        if entries.iter().any(|e| e.id == entry.id) {
            continue;
        }

        let mut granted = Vec::new();
        for id in 0..gpu_count {
            if before_owned.contains(&id) {
                continue;
            }
            if let crate::state::GpuRecord::Reserved { actual_user, .. } = ctx.engine.record(id).await? {
                if actual_user == entry.actual_user {
                    granted.push(id);
                }
            }
        }

        if granted.len() >= target {
            return Ok(granted);
        }
        let timed_out = entry
            .expiry_or_timeout
            .map(|deadline| now.inner() > deadline.inner())
            .unwrap_or(false);
        return Err(if timed_out {
            crate::error::GpuholdError::WaitTimedOut(now.since(entry.enqueue_time)).into()
        } else {
            crate::error::GpuholdError::Cancelled.into()
        });
    }
}
