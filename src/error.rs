// src/error.rs
//
// =============================================================================
// GPUHOLD: ERROR TAXONOMY
// =============================================================================
//
// The domain error kinds from the reservation engine's contract. CLI-layer
// plumbing (I/O, KV transport, subprocess spawn) stays in `anyhow::Result`;
// this enum is reserved for conditions callers are expected to branch on.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuholdError {
    #[error("pool is not initialized; run `admin --gpus N` first")]
    NotInitialized,

    #[error("pool already initialized; pass --force to reinitialize")]
    AlreadyInitialized,

    #[error(
        "insufficient resources: requested {requested}, available {available}, \
         {held} held by reservations, {excluded} in use without reservation"
    )]
    InsufficientResources {
        requested: usize,
        available: usize,
        held: usize,
        excluded: usize,
    },

    #[error("failed to acquire allocation lock after {attempts} attempts")]
    LockAcquisitionFailed { attempts: u32 },

    #[error("no GPU probe binary available on PATH")]
    ProviderUnavailable,

    #[error("GPU record {0} could not be parsed")]
    StateCorrupt(u32),

    #[error("wait cancelled")]
    Cancelled,

    #[error("wait timed out after {0:?}")]
    WaitTimedOut(std::time::Duration),

    #[error("external command failed: {0}")]
    ExternalCommandFailed(String),

    #[error("gpu id {0} out of range for a pool of size {1}")]
    InvalidGpuId(u32, u32),

    #[error("request.count ({count}) does not match len(request.ids) ({ids})")]
    CountIdMismatch { count: usize, ids: usize },
}
