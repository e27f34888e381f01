use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::manager::SessionRegistry;

/// Periodically evict idle sessions until `shutdown` fires.
///
/// Idleness is judged on message and output activity only. A shell doing
/// silent work with no client keepalive is reaped like any other idle
/// session.
pub fn spawn_reaper(registry: Arc<SessionRegistry>, shutdown: CancellationToken) -> JoinHandle<()> {
    let period = registry.policy().reap_interval;
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = registry.sweep().await;
                    if !reaped.is_empty() {
                        tracing::info!(count = reaped.len(), "reaper evicted idle sessions");
                    }
                }
            }
        }
        tracing::debug!("reaper stopped");
    })
}
