//! Periodic sweep reclaiming sessions nobody is attached to.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::registry::DocumentRegistry;

/// Background sweep task. Aborted when dropped.
pub struct Reaper {
    handle: JoinHandle<()>,
}

impl Reaper {
    /// Sweep `registry` every `interval`, starting one interval from now.
    pub fn spawn(registry: Arc<DocumentRegistry>, interval: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick fires immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let reaped = registry.reap_idle().await;
                if !reaped.is_empty() {
                    log::info!(
                        "Reclaimed {} idle sessions: {} ({} remain)",
                        reaped.len(),
                        reaped.join(", "),
                        registry.size().await
                    );
                }
            }
        });
        Self { handle }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
