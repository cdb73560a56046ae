//! Peer-side façade.
//!
//! A `PeerNode` serves pieces of its shared files, keeps its tracker record
//! alive, and fetches files from other peers.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::liveness::{HeartbeatEmitter, HeartbeatHandle};
use crate::config::PeerdropConfig;
use crate::download::{
    Candidate, DownloadError, DownloadJob, DownloadReport, DownloadScheduler, ProgressObserver,
};
use crate::tracker::{FileAssignment, PeerKey, TrackerClient, TrackerError};
use crate::transfer::{
    FileDescriptor, PieceFetcher, PieceServer, PieceServerHandle, SharedLibrary, TcpPieceFetcher,
    TransferError,
};
use crate::{PeerdropError, Result};

/// One peer: piece server, heartbeats and download orchestration.
pub struct PeerNode {
    config: PeerdropConfig,
    client: Arc<dyn TrackerClient>,
    library: Arc<SharedLibrary>,
    scheduler: DownloadScheduler,
    server: PieceServerHandle,
    heartbeats: HeartbeatHandle,
}

impl PeerNode {
    /// Binds the piece server on `bind_address` and starts heartbeating.
    ///
    /// The node is not registered until [`share`](Self::share) or
    /// [`register`](Self::register) is called.
    ///
    /// # Errors
    /// - `PeerdropError::Transfer` - Piece server could not bind
    pub async fn start(
        config: PeerdropConfig,
        client: Arc<dyn TrackerClient>,
        bind_address: SocketAddr,
    ) -> Result<Self> {
        let fetcher = Arc::new(TcpPieceFetcher::from_config(&config.transfer));
        Self::start_with_fetcher(config, client, bind_address, fetcher).await
    }

    /// Like [`start`](Self::start) with a custom piece transport.
    ///
    /// # Errors
    /// - `PeerdropError::Transfer` - Piece server could not bind
    pub async fn start_with_fetcher(
        config: PeerdropConfig,
        client: Arc<dyn TrackerClient>,
        bind_address: SocketAddr,
        fetcher: Arc<dyn PieceFetcher>,
    ) -> Result<Self> {
        let library = Arc::new(SharedLibrary::new());
        let server = PieceServer::new(Arc::clone(&library), config.transfer.piece_timeout)
            .bind(bind_address)
            .await?;
        let port = server.local_addr().port();

        let heartbeats = HeartbeatEmitter::new(
            Arc::clone(&client),
            Arc::clone(&library),
            port,
            config.liveness.heartbeat_interval,
        )
        .spawn();
        let scheduler = DownloadScheduler::new(fetcher, &config.transfer);

        tracing::info!(
            address = %server.local_addr(),
            tracker = client.tracker_url(),
            "Peer started"
        );

        Ok(Self {
            config,
            client,
            library,
            scheduler,
            server,
            heartbeats,
        })
    }

    /// Address the piece server listens on.
    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Serving port, advertised to the tracker.
    pub fn port(&self) -> u16 {
        self.local_addr().port()
    }

    pub fn library(&self) -> &Arc<SharedLibrary> {
        &self.library
    }

    /// Heartbeats accepted by the tracker since start.
    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats.sent()
    }

    /// Shares a file: hashes it, publishes its descriptor and registers the
    /// updated inventory.
    ///
    /// # Errors
    /// - `PeerdropError::Transfer` - File unreadable or badly named
    /// - `PeerdropError::Tracker` - Descriptor conflict or registration rejected
    pub async fn share(&self, path: &Path) -> Result<Arc<FileDescriptor>> {
        let descriptor = self
            .library
            .share_file(path, self.config.transfer.piece_size)
            .await?;

        let published = FileDescriptor::clone(&descriptor)
            .with_tracker_address(self.client.tracker_url());
        let stored = self.client.publish_descriptor(&published).await?;
        tracing::debug!(file = %descriptor.name, stored, "Descriptor published");

        self.register().await?;
        Ok(descriptor)
    }

    /// Registers the current inventory with the tracker.
    ///
    /// # Errors
    /// - `PeerdropError::Tracker` - Registration rejected or tracker unreachable
    pub async fn register(&self) -> Result<()> {
        let (files, sizes): (Vec<String>, Vec<u64>) = self.library.inventory().into_iter().unzip();
        self.client.register(self.port(), &files, &sizes).await?;
        Ok(())
    }

    /// Asks the tracker for one reserved idle holder per file, retrying
    /// while not enough peers are idle.
    ///
    /// # Errors
    /// - `TrackerError::NotEnoughPeers` - Still unmatched after every attempt
    pub async fn request_assignment(
        &self,
        filenames: &[String],
    ) -> std::result::Result<FileAssignment, TrackerError> {
        let attempts = self.config.assignment.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.client.file_idle_peers(self.port(), filenames).await {
                Ok(assignment) => return Ok(assignment),
                Err(TrackerError::NotEnoughPeers { requested, matched }) if attempt < attempts => {
                    tracing::debug!(
                        attempt,
                        requested,
                        matched,
                        "Not enough idle peers, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.config.assignment.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Downloads `filenames` into `output_dir`, one job per file.
    ///
    /// Every reserved peer is released once its job ends, whatever the
    /// outcome. Alternates that also served pieces were never marked Busy,
    /// so no completion is sent for them. Finished files are added to this
    /// node's library and the inventory is registered again.
    ///
    /// # Errors
    /// - `PeerdropError::Tracker` - No assignment or descriptor unavailable
    /// - `PeerdropError::Download` - First job that failed
    pub async fn fetch_files(
        &self,
        filenames: &[String],
        output_dir: &Path,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<Vec<DownloadReport>> {
        let assignment = self.request_assignment(filenames).await?;

        let jobs = match self.prepare_jobs(&assignment, output_dir).await {
            Ok(jobs) => jobs,
            Err(e) => {
                for peer in assignment.peers.values() {
                    self.release(*peer).await;
                }
                return Err(e);
            }
        };

        let handles: Vec<_> = jobs
            .into_iter()
            .map(|(job, reserved)| {
                let descriptor = Arc::clone(&job.descriptor);
                let handle = self.scheduler.start(job, Arc::clone(&observer));
                (handle, descriptor, reserved)
            })
            .collect();

        let mut reports = Vec::with_capacity(handles.len());
        let mut first_error: Option<DownloadError> = None;
        for (handle, descriptor, reserved) in handles {
            let outcome = handle.wait().await;
            self.release(reserved).await;

            match outcome {
                Ok(report) => {
                    self.library
                        .insert(report.destination.clone(), FileDescriptor::clone(&descriptor));
                    reports.push(report);
                }
                Err(e) => {
                    tracing::warn!(file = %descriptor.name, error = %e, "Fetch failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if !reports.is_empty()
            && let Err(e) = self.register().await
        {
            tracing::warn!(error = %e, "Could not register downloaded files");
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(reports),
        }
    }

    async fn prepare_jobs(
        &self,
        assignment: &FileAssignment,
        output_dir: &Path,
    ) -> Result<Vec<(DownloadJob, PeerKey)>> {
        let mut jobs = Vec::with_capacity(assignment.peers.len());
        for (filename, reserved) in &assignment.peers {
            let descriptor = self.client.descriptor(filename).await?;
            descriptor.validate()?;
            if descriptor.name != *filename {
                return Err(TransferError::InvalidDescriptor {
                    reason: format!("tracker sent {} for {filename}", descriptor.name),
                }
                .into());
            }
            if let Some(&size) = assignment.file_sizes.get(filename)
                && size != descriptor.total_size
            {
                return Err(TransferError::InvalidDescriptor {
                    reason: format!(
                        "{filename} is {size} bytes but its descriptor says {}",
                        descriptor.total_size
                    ),
                }
                .into());
            }

            let candidates = std::iter::once(*reserved)
                .chain(assignment.alternates.get(filename).into_iter().flatten().copied())
                .map(|peer| Candidate::whole(peer.address()))
                .collect();
            let destination: PathBuf = output_dir.join(filename);
            jobs.push((
                DownloadJob::new(Arc::new(descriptor), candidates, destination),
                *reserved,
            ));
        }
        Ok(jobs)
    }

    async fn release(&self, peer: PeerKey) {
        if let Err(e) = self.client.complete_transfer(peer).await {
            tracing::warn!(peer = %peer, error = %e, "Could not release serving peer");
        }
    }

    /// Leaves the network: stops heartbeats, removes the tracker record and
    /// stops serving.
    ///
    /// # Errors
    /// - `PeerdropError::Tracker` - Tracker rejected the disconnect
    pub async fn disconnect(self) -> Result<()> {
        let port = self.port();
        self.heartbeats.stop().await;
        let result = self.client.disconnect(port).await;
        self.server.shutdown().await;
        tracing::info!(port, "Peer disconnected");
        result.map_err(PeerdropError::from)
    }

    /// Stops heartbeats and serving without telling the tracker.
    pub async fn shutdown(self) {
        self.heartbeats.stop().await;
        self.server.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::download::NoProgress;
    use crate::tracker::{LocalTrackerClient, PeerRegistry, PeerStatus};

    fn config() -> PeerdropConfig {
        let mut config = PeerdropConfig::for_testing();
        config.transfer.piece_size = 1000;
        config
    }

    fn registry() -> Arc<PeerRegistry> {
        Arc::new(PeerRegistry::new(
            Duration::from_secs(60),
            Duration::from_secs(300),
        ))
    }

    async fn node(registry: &Arc<PeerRegistry>) -> PeerNode {
        let client = Arc::new(LocalTrackerClient::new(Arc::clone(registry)));
        PeerNode::start(config(), client, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_share_registers_and_publishes() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f1.bin");
        tokio::fs::write(&path, vec![7u8; 2500]).await.unwrap();

        let peer = node(&registry).await;
        let descriptor = peer.share(&path).await.unwrap();
        assert_eq!(descriptor.piece_count(), 3);

        let record = registry.peer(PeerKey::new(peer.local_addr())).unwrap();
        assert!(record.holds("f1.bin"));
        assert_eq!(registry.descriptor("f1.bin").unwrap().piece_hashes, descriptor.piece_hashes);

        peer.disconnect().await.unwrap();
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_downloads_and_releases_server() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        let content: Vec<u8> = (0..2500u32).map(|i| (i % 199) as u8).collect();
        let path = dir.path().join("f1.bin");
        tokio::fs::write(&path, &content).await.unwrap();

        let seeder = node(&registry).await;
        seeder.share(&path).await.unwrap();
        let fetcher = node(&registry).await;
        fetcher.register().await.unwrap();

        let output = dir.path().join("downloads");
        let reports = fetcher
            .fetch_files(&["f1.bin".to_string()], &output, Arc::new(NoProgress))
            .await
            .unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].pieces, 3);
        assert!(reports[0].served_by.contains(&seeder.local_addr()));
        assert_eq!(tokio::fs::read(output.join("f1.bin")).await.unwrap(), content);

        let seeder_record = registry.peer(PeerKey::new(seeder.local_addr())).unwrap();
        assert_eq!(seeder_record.status, PeerStatus::Idle);

        // The downloader now holds the file too.
        let fetcher_record = registry.peer(PeerKey::new(fetcher.local_addr())).unwrap();
        assert!(fetcher_record.holds("f1.bin"));
        assert!(fetcher.library().contains("f1.bin"));

        seeder.shutdown().await;
        fetcher.shutdown().await;
    }

    #[tokio::test]
    async fn test_fetch_without_holders_is_not_enough_peers() {
        let registry = registry();
        let peer = node(&registry).await;
        peer.register().await.unwrap();

        let error = peer
            .fetch_files(
                &["missing.bin".to_string()],
                Path::new("/nonexistent"),
                Arc::new(NoProgress),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            PeerdropError::Tracker(TrackerError::NotEnoughPeers { requested: 1, matched: 0 })
        ));
        peer.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_job_still_releases_reserved_peer() {
        let registry = registry();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f2.bin");
        tokio::fs::write(&path, vec![1u8; 1500]).await.unwrap();

        let seeder = node(&registry).await;
        seeder.share(&path).await.unwrap();
        let seeder_key = PeerKey::new(seeder.local_addr());
        // Stop serving while staying registered.
        seeder.shutdown().await;

        let fetcher = node(&registry).await;
        fetcher.register().await.unwrap();
        let error = fetcher
            .fetch_files(
                &["f2.bin".to_string()],
                &dir.path().join("downloads"),
                Arc::new(NoProgress),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            PeerdropError::Download(DownloadError::IncompleteTransfer { .. })
        ));
        assert!(registry.peer(seeder_key).unwrap().is_idle());
        fetcher.shutdown().await;
    }
}
