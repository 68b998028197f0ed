// src/main.rs
//
// =============================================================================
// GPUHOLD: ENTRY POINT
// =============================================================================
//
// Wires up the KV connection, clock, allocation engine, and probe provider,
// then hands off to `cli::dispatch`.

use anyhow::{Context, Result};
use clap::Parser;
use gpuhold::cli::{build_provider, Cli, Commands, Context as CliContext};
use gpuhold::kv::RedisKv;
use gpuhold::state::Provider;
use gpuhold::time::SystemClock;
use gpuhold::validator::Validator;
use gpuhold::{config::Config, AllocationEngine};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // The hidden `supervisor` subcommand is exec'd detached from its parent's
    // stderr; logging to it is pointless and env_logger's default target
    // would otherwise just write into the void.
    if !matches!(cli.command, Commands::Supervisor { .. }) {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    let config = Config::from_env();
    let kv = Arc::new(RedisKv::connect(&config.redis_url).await.context("connecting to redis")?);
    let clock = Arc::new(SystemClock);
    let engine = Arc::new(AllocationEngine::new(kv.clone(), clock.clone(), config.heartbeat_timeout));

    // The provider is chosen once at `admin` time and recorded in pool_meta;
    // every other command just reloads whichever one that was.
    let provider_kind = engine.pool_meta().await?.map(|m| m.provider).unwrap_or(Provider::Fake);
    let provider = build_provider(provider_kind);

    let validator = Arc::new(Validator::new(
        engine.clone(),
        provider.clone(),
        clock.clone(),
        config.memory_threshold_mb,
    ));

    let ctx = CliContext { engine, validator, provider, kv, clock, config };

    let code = gpuhold::cli::dispatch(cli, ctx).await?;
    std::process::exit(code);
}
