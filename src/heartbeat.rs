// src/heartbeat.rs
//
// =============================================================================
// GPUHOLD: HEARTBEAT MANAGER (spec.md §4.3)
// =============================================================================
//
// One task per active `run` lease. Ticks every HEARTBEAT_INTERVAL until
// stopped; on stop, releases the lease's GPUs. Each tick is a
// compare-and-refresh gated on the record still belonging to the same
// (actual_user, start_time) pair -- if the sweep already reaped it, the
// tick must not resurrect the lease; it logs and exits instead.

use crate::engine::AllocationEngine;
use crate::state::GpuId;
use crate::time::Timestamp;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub struct HeartbeatManager {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl HeartbeatManager {
    /// Spawns the background tick loop. `engine` must outlive the handle it
    /// hands back, so it is passed in as an `Arc`.
    pub fn spawn(
        engine: Arc<AllocationEngine>,
        actual_user: String,
        start_time: Timestamp,
        gpu_ids: Vec<GpuId>,
        interval: Duration,
    ) -> Self {
        let stop = Arc::new(Notify::new());
        let stop_wait = stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_wait.notified() => break,
                }

                let mut any_alive = false;
                for &id in &gpu_ids {
                    match engine.tick_heartbeat(id, &actual_user, start_time).await {
                        Ok(true) => any_alive = true,
                        Ok(false) => {
                            log::info!(
                                "heartbeat for gpu {id} (user={actual_user}) found the lease \
                                 already reassigned or reaped; exiting without resurrecting it"
                            );
                        }
                        Err(e) => {
                            log::warn!("heartbeat tick failed for gpu {id}: {e}");
                        }
                    }
                }

                if !any_alive {
                    break;
                }
            }

            log::info!("heartbeat manager stopped for user={actual_user}, releasing lease");
            match engine.release_specific(&actual_user, &gpu_ids).await {
                Ok(outcome) => log::info!(
                    "released {} gpu(s) on heartbeat stop",
                    outcome.released.len()
                ),
                Err(e) => log::error!("failed to release on heartbeat stop: {e}"),
            }
        });

        Self { stop, handle }
    }

    /// Signals the loop to stop and perform its release; awaits completion.
    pub async fn stop(self) {
        self.stop.notify_one();
        let _ = self.handle.await;
    }
}
