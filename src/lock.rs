// src/lock.rs
//
// =============================================================================
// GPUHOLD: NAMED ALLOCATION LOCK (spec_full.md §5, §11 Open Question)
// =============================================================================
//
// Every mutation that consults availability and then writes reservation
// state runs under this lock instead of inside a server-side Lua script
// (see SPEC_FULL.md §11 for why). Acquired via SET-NX-TTL with exponential
// backoff, base 2, jitter in [0, 1s], up to 5 attempts; TTL 10s bounds how
// long a crashed holder can block everyone else.

use crate::config::{LOCK_INITIAL_BACKOFF, LOCK_MAX_ATTEMPTS, LOCK_TTL};
use crate::error::GpuholdError;
use crate::kv::KvStore;
use rand::Rng;
use std::sync::Arc;
use uuid::Uuid;

pub struct AllocationLock {
    kv: Arc<dyn KvStore>,
    key: String,
}

/// RAII guard; releases the lock (best-effort compare-and-delete) on drop.
/// Liberation is guaranteed either way by the TTL.
pub struct LockGuard {
    kv: Arc<dyn KvStore>,
    key: String,
    token: String,
}

impl AllocationLock {
    pub fn new(kv: Arc<dyn KvStore>, key: impl Into<String>) -> Self {
        Self { kv, key: key.into() }
    }

    pub async fn acquire(&self) -> Result<LockGuard, GpuholdError> {
        let token = Uuid::new_v4().to_string();
        let mut backoff = LOCK_INITIAL_BACKOFF;

        for attempt in 1..=LOCK_MAX_ATTEMPTS {
            let acquired = self
                .kv
                .set_nx_ex(&self.key, &token, LOCK_TTL)
                .await
                .unwrap_or(false);

            if acquired {
                return Ok(LockGuard {
                    kv: self.kv.clone(),
                    key: self.key.clone(),
                    token,
                });
            }

            if attempt == LOCK_MAX_ATTEMPTS {
                break;
            }

            let jitter = rand::thread_rng().gen_range(0..1000);
            tokio::time::sleep(backoff + std::time::Duration::from_millis(jitter)).await;
            backoff *= 2;
        }

        Err(GpuholdError::LockAcquisitionFailed {
            attempts: LOCK_MAX_ATTEMPTS,
        })
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let kv = self.kv.clone();
        let key = self.key.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            // Compare-then-delete: best effort, the TTL is the real backstop
            // if this task gets dropped before it runs (process exit, abort).
            if let Ok(Some(held)) = kv.get_raw(&key).await {
                if held == token {
                    let _ = kv.delete(&key).await;
                }
            }
        });
    }
}
