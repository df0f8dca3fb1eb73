//! Liveness sweeper
//!
//! Periodically evicts sessions whose agents stopped sending heartbeats.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::SharedSessionRegistry;

/// Spawn the sweeper background task.
///
/// Runs [`SessionRegistry::sweep`](crate::SessionRegistry::sweep) every
/// `interval` until `cancel` fires.
#[must_use]
pub fn spawn_sweeper(
    registry: SharedSessionRegistry,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("sweeper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = registry.sweep(acert_common::unix_now());
                    if !evicted.is_empty() {
                        debug!(count = evicted.len(), remaining = registry.len(), "sweep evicted sessions");
                    }
                }
            }
        }
    })
}

/// Wait for a sweeper task to finish, logging a panic or abort instead of
/// propagating it
pub async fn join_sweeper(handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        warn!(error = %e, "sweeper task failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use acert_common::AgentId;

    use crate::registry::SessionRegistry;
    use crate::session::ServerSession;

    #[tokio::test(start_paused = true)]
    async fn evicts_silent_agents_and_stops_on_cancel() {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(20)));
        let (stale, _rx1) = ServerSession::new(AgentId::new("stale").unwrap(), 4);
        let (fresh, _rx2) = ServerSession::new(AgentId::new("fresh").unwrap(), 4);
        let stale = Arc::new(stale);
        let fresh = Arc::new(fresh);
        registry.register(stale.clone());
        registry.register(fresh.clone());

        // Heartbeat from the distant past
        let now = acert_common::unix_now();
        registry.record_heartbeat("stale", stale.id(), 1, 1);
        registry.record_heartbeat("fresh", fresh.id(), now, now);

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(registry.clone(), Duration::from_secs(5), cancel.clone());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!registry.is_connected("stale"));
        assert!(stale.is_closed());
        assert!(registry.is_connected("fresh"));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn join_sweeper_absorbs_task_panic() {
        let handle: JoinHandle<()> = tokio::spawn(async { panic!("sweep failed") });
        join_sweeper(handle).await;

        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(20)));
        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(registry, Duration::from_secs(5), cancel.clone());
        cancel.cancel();
        join_sweeper(handle).await;
    }
}
