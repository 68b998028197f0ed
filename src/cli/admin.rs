// src/cli/admin.rs -- `gpuhold admin` (spec.md §6.1)

use super::{build_provider, Context, ProviderArg};
use crate::probe::GpuProvider;
use anyhow::Context as _;

pub async fn run(ctx: &Context, gpus: u32, force: bool, provider: ProviderArg) -> anyhow::Result<i32> {
    let provider_kind: crate::state::Provider = provider.into();
    let probe = build_provider(provider_kind);

    if !matches!(provider_kind, crate::state::Provider::Fake) && !probe.available().await {
        return Err(crate::error::GpuholdError::ProviderUnavailable)
            .context("admin init requires a working GPU probe binary; pass --provider fake to skip");
    }

    match ctx.engine.init_pool(gpus, provider_kind, force).await {
        Ok(()) => {
            log::info!("pool initialized: {gpus} gpu(s), provider={provider_kind:?}");
            println!("initialized pool with {gpus} gpu(s) (provider={provider_kind:?})");
            Ok(0)
        }
        Err(e @ crate::error::GpuholdError::AlreadyInitialized) => {
            eprintln!("error: {e}");
            Ok(1)
        }
        Err(e) => Err(e.into()),
    }
}
