//! Tracker lifecycle and the periodic liveness sweep.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::PeerRegistry;
use crate::config::TrackerConfig;

/// Background task running [`PeerRegistry::sweep`] on a fixed period.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Starts sweeping every `interval`. The first sweep happens one full
    /// interval after start.
    pub fn spawn(registry: Arc<PeerRegistry>, interval: Duration) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let outcome = registry.sweep();
                        if !outcome.evicted.is_empty() || !outcome.released.is_empty() {
                            tracing::info!(
                                evicted = outcome.evicted.len(),
                                released = outcome.released.len(),
                                remaining = registry.len(),
                                "Liveness sweep"
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!("Liveness sweep stopped");
        });

        Self { shutdown, task }
    }

    /// Stops the sweep and waits for the task to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Owns the registry and its sweep: `new`, then `start`, then `close`.
pub struct Tracker {
    registry: Arc<PeerRegistry>,
    sweep_interval: Duration,
    sweeper: Option<SweeperHandle>,
}

impl Tracker {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            registry: Arc::new(PeerRegistry::from_config(config)),
            sweep_interval: config.sweep_interval,
            sweeper: None,
        }
    }

    /// Handle passed to every request handler.
    pub fn registry(&self) -> Arc<PeerRegistry> {
        Arc::clone(&self.registry)
    }

    /// Starts the liveness sweep; calling it again is a no-op.
    pub fn start(&mut self) {
        if self.sweeper.is_none() {
            self.sweeper = Some(SweeperHandle::spawn(
                Arc::clone(&self.registry),
                self.sweep_interval,
            ));
            tracing::info!(interval = ?self.sweep_interval, "Liveness sweep started");
        }
    }

    pub fn is_running(&self) -> bool {
        self.sweeper.is_some()
    }

    /// Stops the sweep.
    pub async fn close(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::PeerKey;

    fn config() -> TrackerConfig {
        TrackerConfig {
            eviction_timeout: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(30),
            ..TrackerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_gone_after_timeout_plus_interval() {
        let mut tracker = Tracker::new(&config());
        let registry = tracker.registry();
        tracker.start();

        let d = PeerKey::new("10.0.0.4:7004".parse().unwrap());
        registry.register(d, &["f1".to_string()], &[10]).unwrap();

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(registry.peer(d).is_some());

        tokio::time::sleep(Duration::from_secs(32)).await;
        assert!(registry.peer(d).is_none());

        tracker.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeating_peer_survives() {
        let mut tracker = Tracker::new(&config());
        let registry = tracker.registry();
        tracker.start();

        let a = PeerKey::new("10.0.0.1:7001".parse().unwrap());
        registry.register(a, &[], &[]).unwrap();

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            registry.heartbeat(a).unwrap();
        }
        assert!(registry.peer(a).is_some());

        tracker.close().await;
    }

    #[tokio::test]
    async fn test_close_stops_sweep() {
        let mut tracker = Tracker::new(&config());
        tracker.start();
        tracker.start();
        assert!(tracker.is_running());
        tracker.close().await;
    }
}
