// Liveness sweeps: periodically evict participants whose connection has
// gone quiet. Heartbeats are refreshed by the gateway on every inbound
// frame (pongs included), so a participant only goes stale when its
// transport is silently dead.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::room::RoomRegistry;

pub struct LivenessMonitor {
    registry: Arc<RoomRegistry>,
    sweep_interval: Duration,
    participant_timeout: chrono::Duration,
}

impl LivenessMonitor {
    pub fn new(
        registry: Arc<RoomRegistry>,
        sweep_interval: Duration,
        participant_timeout: chrono::Duration,
    ) -> Self {
        Self { registry, sweep_interval, participant_timeout }
    }

    /// Run the sweep loop for the lifetime of the process.
    pub fn spawn(self) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sweep_interval);
            // The first tick fires immediately; skip it so a freshly booted
            // relay does not sweep before anyone has had a chance to join.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let evicted = self.registry.evict_stale(self.participant_timeout).await;
                if evicted > 0 {
                    info!(evicted, "liveness sweep evicted idle participants");
                } else {
                    debug!("liveness sweep found no idle participants");
                }
            }
        });
    }
}
