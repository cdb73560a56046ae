//! Tracker-side peer registry, file catalog and assignment.
//!
//! The tracker keeps one [`PeerRecord`] per `(address, port)`, knows which
//! files each peer holds and whether it is free to serve, and pairs requested
//! files with distinct idle holders via maximum bipartite matching.

pub mod assignment;
pub mod catalog;
pub mod client;
pub mod local;
pub mod messages;
pub mod registry;
pub mod sweeper;

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub use assignment::{Assignment, compute_assignment};
pub use catalog::{FileCatalog, TrackedFile};
pub use client::{HttpTrackerClient, TrackerClient};
pub use local::LocalTrackerClient;
pub use registry::{FileAssignment, PeerRegistry, SweepOutcome};
pub use sweeper::{SweeperHandle, Tracker};

/// Identity of a peer: the address it serves pieces on.
///
/// Ordering is by IP address, then port, which is the tie-breaking order
/// used by assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerKey(pub SocketAddr);

impl PeerKey {
    pub fn new(address: SocketAddr) -> Self {
        Self(address)
    }

    pub fn address(self) -> SocketAddr {
        self.0
    }
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<SocketAddr> for PeerKey {
    fn from(address: SocketAddr) -> Self {
        Self(address)
    }
}

/// Availability of a peer for new transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Idle,
    Busy,
}

/// Tracker's view of one registered peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub key: PeerKey,
    pub status: PeerStatus,
    pub files: BTreeSet<String>,
    pub last_heartbeat: Instant,
    /// When the peer last became Busy, used for force-release.
    pub busy_since: Option<Instant>,
    pub registered_at: DateTime<Utc>,
}

impl PeerRecord {
    pub fn is_idle(&self) -> bool {
        self.status == PeerStatus::Idle
    }

    pub fn holds(&self, filename: &str) -> bool {
        self.files.contains(filename)
    }
}

/// Errors from the registry and the control-plane client.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Invalid registration: {reason}")]
    InvalidRegistration { reason: String },

    #[error("Peer {peer} is not registered")]
    NotRegistered { peer: PeerKey },

    #[error("Only {matched} of {requested} requested files could be assigned to idle peers")]
    NotEnoughPeers { requested: usize, matched: usize },

    #[error("Peer {peer} is busy")]
    PeerBusy { peer: PeerKey },

    #[error("Unknown file {filename}")]
    UnknownFile { filename: String },

    #[error("A different descriptor for {filename} is already published")]
    DescriptorConflict { filename: String },

    #[error("Tracker request to {url} timed out")]
    TrackerTimeout { url: String },

    #[error("Tracker request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tracker protocol error: {message}")]
    Protocol { message: String },

    #[error("Tracker rejected request ({kind}): {message}")]
    Rejected { kind: String, message: String },
}

impl TrackerError {
    /// Stable identifier used when the error crosses the HTTP boundary.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRegistration { .. } => "invalid_registration",
            Self::NotRegistered { .. } => "not_registered",
            Self::NotEnoughPeers { .. } => "not_enough_peers",
            Self::PeerBusy { .. } => "peer_busy",
            Self::UnknownFile { .. } => "unknown_file",
            Self::DescriptorConflict { .. } => "descriptor_conflict",
            Self::TrackerTimeout { .. } => "tracker_timeout",
            Self::Http(_) => "http",
            Self::Protocol { .. } => "protocol",
            Self::Rejected { .. } => "rejected",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_key_orders_by_address_then_port() {
        let mut keys: Vec<PeerKey> = [
            "10.0.0.2:5000",
            "10.0.0.1:6000",
            "10.0.0.1:5000",
            "9.255.255.255:9000",
        ]
        .iter()
        .map(|s| PeerKey::new(s.parse().unwrap()))
        .collect();
        keys.sort();

        let sorted: Vec<String> = keys.iter().map(ToString::to_string).collect();
        assert_eq!(
            sorted,
            vec![
                "9.255.255.255:9000",
                "10.0.0.1:5000",
                "10.0.0.1:6000",
                "10.0.0.2:5000"
            ]
        );
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(serde_json::to_string(&PeerStatus::Idle).unwrap(), "\"idle\"");
        assert_eq!(serde_json::to_string(&PeerStatus::Busy).unwrap(), "\"busy\"");
    }
}
