//! Test fixtures shared by unit and integration tests.
//!
//! Provides sample files, descriptors and in-process peers so tests across
//! crates build the same scenarios the same way.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::PeerNode;
use crate::config::PeerdropConfig;
use crate::tracker::{LocalTrackerClient, PeerRegistry, TrackerClient};

/// Deterministic, non-repeating-looking content of `len` bytes.
pub fn sample_content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u32).wrapping_mul(31).wrapping_add(u32::from(seed)) % 251) as u8)
        .collect()
}

/// Writes `content` to `name` inside `dir`.
///
/// # Panics
///
/// Panics if the file cannot be written. This is acceptable in test fixtures
/// where failures indicate environment issues.
pub fn write_sample_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Registry with the default eviction and busy timeouts.
pub fn test_registry() -> Arc<PeerRegistry> {
    Arc::new(PeerRegistry::from_config(
        &PeerdropConfig::for_testing().tracker,
    ))
}

/// Loopback peer talking to `client`.
///
/// # Panics
///
/// Panics if the piece server cannot bind to loopback.
pub async fn spawn_peer(config: PeerdropConfig, client: Arc<dyn TrackerClient>) -> PeerNode {
    let loopback = SocketAddr::from(([127, 0, 0, 1], 0));
    PeerNode::start(config, client, loopback).await.unwrap()
}

/// Loopback peer registered directly against `registry`.
///
/// # Panics
///
/// Panics if the piece server cannot bind to loopback.
pub async fn spawn_local_peer(registry: &Arc<PeerRegistry>) -> PeerNode {
    let client = Arc::new(LocalTrackerClient::new(Arc::clone(registry)));
    spawn_peer(PeerdropConfig::for_testing(), client).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_content_is_deterministic() {
        assert_eq!(sample_content(300, 1), sample_content(300, 1));
        assert_ne!(sample_content(300, 1), sample_content(300, 2));
    }

    #[tokio::test]
    async fn test_local_peer_shares_sample_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_sample_file(&dir, "f1.bin", &sample_content(3000, 0));
        let registry = test_registry();

        let peer = spawn_local_peer(&registry).await;
        peer.share(&path).await.unwrap();
        assert_eq!(registry.len(), 1);
        peer.shutdown().await;
    }
}
