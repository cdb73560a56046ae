//! Peer-side heartbeats.
//!
//! Heartbeats run on their own task so a long download never starves them.
//! If the tracker no longer knows the peer (it was evicted while
//! unreachable), the emitter registers the current inventory again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::tracker::{TrackerClient, TrackerError};
use crate::transfer::SharedLibrary;

/// Running heartbeat task.
pub struct HeartbeatHandle {
    shutdown: watch::Sender<bool>,
    sent: Arc<AtomicU64>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Heartbeats the tracker accepted so far.
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Stops heartbeating and waits for the task to end.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// Sends a heartbeat for one serving port every `interval`.
pub struct HeartbeatEmitter {
    client: Arc<dyn TrackerClient>,
    library: Arc<SharedLibrary>,
    port: u16,
    interval: Duration,
}

impl HeartbeatEmitter {
    pub fn new(
        client: Arc<dyn TrackerClient>,
        library: Arc<SharedLibrary>,
        port: u16,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            library,
            port,
            interval,
        }
    }

    /// Starts the task. The first heartbeat goes out one interval after start.
    pub fn spawn(self) -> HeartbeatHandle {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let sent = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&sent);

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if self.beat().await {
                            counter.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            tracing::debug!(port = self.port, "Heartbeats stopped");
        });

        HeartbeatHandle {
            shutdown,
            sent,
            task,
        }
    }

    async fn beat(&self) -> bool {
        match self.client.heartbeat(self.port).await {
            Ok(()) => {
                tracing::trace!(port = self.port, "Heartbeat sent");
                true
            }
            Err(TrackerError::NotRegistered { .. }) => {
                tracing::warn!(
                    port = self.port,
                    tracker = self.client.tracker_url(),
                    "Tracker forgot this peer, registering again"
                );
                self.reregister().await
            }
            Err(e) => {
                tracing::warn!(port = self.port, error = %e, "Heartbeat failed");
                false
            }
        }
    }

    async fn reregister(&self) -> bool {
        let (files, sizes): (Vec<String>, Vec<u64>) = self.library.inventory().into_iter().unzip();
        match self.client.register(self.port, &files, &sizes).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(port = self.port, error = %e, "Re-registration failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::tracker::{LocalTrackerClient, PeerKey, PeerRegistry};

    fn key(port: u16) -> PeerKey {
        PeerKey::new(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_peer_registered() {
        let registry = Arc::new(PeerRegistry::new(
            Duration::from_secs(60),
            Duration::from_secs(300),
        ));
        let client = Arc::new(LocalTrackerClient::new(Arc::clone(&registry)));
        client.register(7001, &[], &[]).await.unwrap();

        let handle = HeartbeatEmitter::new(
            client,
            Arc::new(SharedLibrary::new()),
            7001,
            Duration::from_secs(10),
        )
        .spawn();

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_secs(10)).await;
            registry.evict();
        }
        assert!(registry.peer(key(7001)).is_some());
        assert!(handle.sent() >= 19);
        handle.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_evicted_peer_registers_again() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();
        let library = Arc::new(SharedLibrary::new());
        library.share_file(&path, 4).await.unwrap();

        let registry = Arc::new(PeerRegistry::new(
            Duration::from_secs(60),
            Duration::from_secs(300),
        ));
        let client = Arc::new(LocalTrackerClient::new(Arc::clone(&registry)));

        let handle =
            HeartbeatEmitter::new(client, library, 7002, Duration::from_secs(10)).spawn();
        assert!(registry.peer(key(7002)).is_none());

        tokio::time::sleep(Duration::from_secs(11)).await;
        let record = registry.peer(key(7002)).unwrap();
        assert!(record.holds("f1.bin"));
        assert!(record.is_idle());
        handle.stop().await;
    }
}
