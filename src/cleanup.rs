//! Background eviction of idle sessions.

use crate::service::ExecutionService;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

/// Spawns the cleanup loop. It ticks every `every` until `shutdown` flips to
/// true (or its sender is dropped).
///
/// Eviction looks only at last-active, so a session whose sole activity is a
/// long-running stream can be evicted while that stream is still running.
/// The stream itself is unaffected; it just no longer has a session to touch
/// when it ends.
pub fn spawn_cleanup(
    service: Arc<ExecutionService>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = service.sweep().await;
                    if evicted > 0 {
                        info!(evicted, "Cleanup pass finished");
                    } else {
                        debug!("Cleanup pass found nothing to evict");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Cleanup loop stopping");
                        return;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::state::SessionRegistry;

    fn service(timeout: Duration) -> Arc<ExecutionService> {
        Arc::new(ExecutionService::with_registry(
            ServiceConfig {
                session_timeout: timeout,
                rate_limit: 0,
                ..ServiceConfig::default()
            },
            SessionRegistry::new(std::env::temp_dir()),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_evicted_on_next_tick() {
        let svc = service(Duration::from_secs(10));
        let (_tx, rx) = watch::channel(false);
        svc.register("idle", "", "p").await.unwrap();

        let handle = spawn_cleanup(Arc::clone(&svc), Duration::from_secs(1), rx);
        // timeout + 1s of idleness, then one more tick
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(!svc.registry().contains("idle").await);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn active_session_survives_many_ticks() {
        let svc = service(Duration::from_secs(10));
        let (_tx, rx) = watch::channel(false);
        svc.register("busy", "", "p").await.unwrap();

        let handle = spawn_cleanup(Arc::clone(&svc), Duration::from_millis(100), rx);
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            svc.heartbeat("busy", "").await.unwrap();
        }
        assert!(svc.registry().contains("busy").await);
        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_shutdown() {
        let svc = service(Duration::from_secs(10));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_cleanup(svc, Duration::from_secs(1), rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop should stop")
            .unwrap();
    }
}
