// src/lib.rs
//
// =============================================================================
// GPUHOLD: LIBRARY ROOT
// =============================================================================
//
// This file declares the module tree and exports public types.

pub mod cli;
pub mod config;
pub mod duration;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod kv;
pub mod lock;
pub mod probe;
pub mod queue;
pub mod state;
pub mod supervisor;
pub mod time;
pub mod validator;

pub use engine::{AllocationEngine, ReleaseOutcome};
pub use error::GpuholdError;
pub use kv::{KvStore, MemoryKv, RedisKv};
pub use probe::{AmdProvider, FakeProvider, GpuProvider, NvidiaProvider};
pub use state::{GpuId, GpuRecord, LeaseType, PoolMeta, Provider, QueueEntry, ReserveRequest, UsageRecord};
pub use time::{Clock, FixedClock, SystemClock, Timestamp};
pub use validator::{GpuStatus, Validator};
