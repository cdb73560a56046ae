//! In-process tracker client.
//!
//! Calls the registry directly instead of going over HTTP. Used when the
//! tracker and a peer share a process, and by tests that exercise peer logic
//! without a server.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;

use super::messages::PeerSummary;
use super::{FileAssignment, PeerKey, PeerRegistry, TrackedFile, TrackerClient, TrackerError};
use crate::transfer::FileDescriptor;

/// Tracker client bound to a registry handle.
#[derive(Debug, Clone)]
pub struct LocalTrackerClient {
    registry: Arc<PeerRegistry>,
    ip: IpAddr,
}

impl LocalTrackerClient {
    /// Creates a client whose caller appears at `127.0.0.1`.
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self::with_ip(registry, IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// Creates a client whose caller appears at `ip`.
    pub fn with_ip(registry: Arc<PeerRegistry>, ip: IpAddr) -> Self {
        Self { registry, ip }
    }

    fn caller(&self, port: u16) -> PeerKey {
        PeerKey::new(SocketAddr::new(self.ip, port))
    }
}

#[async_trait]
impl TrackerClient for LocalTrackerClient {
    async fn register(
        &self,
        port: u16,
        files: &[String],
        file_sizes: &[u64],
    ) -> Result<(), TrackerError> {
        self.registry.register(self.caller(port), files, file_sizes)
    }

    async fn heartbeat(&self, port: u16) -> Result<(), TrackerError> {
        self.registry.heartbeat(self.caller(port))
    }

    async fn disconnect(&self, port: u16) -> Result<(), TrackerError> {
        self.registry.disconnect(self.caller(port))
    }

    async fn idle_peers(&self, port: u16, count: usize) -> Result<Vec<PeerKey>, TrackerError> {
        self.registry.idle_peers(self.caller(port), count)
    }

    async fn file_idle_peers(
        &self,
        port: u16,
        filenames: &[String],
    ) -> Result<FileAssignment, TrackerError> {
        self.registry
            .assign_files(Some(self.caller(port)), filenames)
    }

    async fn request_file(&self, peer: PeerKey, filename: &str) -> Result<PeerKey, TrackerError> {
        self.registry.request_file(peer, filename)
    }

    async fn complete_transfer(&self, peer: PeerKey) -> Result<(), TrackerError> {
        self.registry.complete_transfer(peer)
    }

    async fn publish_descriptor(&self, descriptor: &FileDescriptor) -> Result<bool, TrackerError> {
        self.registry.publish_descriptor(descriptor.clone())
    }

    async fn descriptor(&self, filename: &str) -> Result<FileDescriptor, TrackerError> {
        self.registry
            .descriptor(filename)
            .map(|descriptor| descriptor.as_ref().clone())
    }

    async fn peers(&self) -> Result<Vec<PeerSummary>, TrackerError> {
        Ok(self
            .registry
            .snapshot()
            .iter()
            .map(PeerSummary::from)
            .collect())
    }

    async fn files(&self) -> Result<Vec<TrackedFile>, TrackerError> {
        Ok(self.registry.files())
    }

    fn tracker_url(&self) -> &str {
        "local"
    }
}
