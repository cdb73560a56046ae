//! Authoritative table of registered peers.
//!
//! Every read-modify-write runs under the write lock, including the
//! matching done for a file request, so two concurrent requesters can never
//! reserve the same idle peer. Snapshot reads take the read lock briefly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::assignment::compute_assignment;
use super::{FileCatalog, PeerKey, PeerRecord, PeerStatus, TrackedFile, TrackerError};
use crate::config::TrackerConfig;
use crate::transfer::{FileDescriptor, is_valid_filename};

/// Peers reserved for a file request, plus fallbacks and known sizes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileAssignment {
    /// Peer reserved (marked Busy) for each requested file.
    pub peers: BTreeMap<String, PeerKey>,
    /// Other idle holders per file, usable as fallback sources.
    #[serde(default)]
    pub alternates: BTreeMap<String, Vec<PeerKey>>,
    #[serde(default)]
    pub file_sizes: BTreeMap<String, u64>,
}

/// Peers removed or released by one liveness sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepOutcome {
    pub evicted: Vec<PeerKey>,
    pub released: Vec<PeerKey>,
}

#[derive(Debug, Default)]
struct RegistryState {
    peers: BTreeMap<PeerKey, PeerRecord>,
    catalog: FileCatalog,
}

/// Shared registry of peers and the file catalog.
#[derive(Debug)]
pub struct PeerRegistry {
    state: RwLock<RegistryState>,
    eviction_timeout: Duration,
    busy_timeout: Duration,
}

impl PeerRegistry {
    pub fn new(eviction_timeout: Duration, busy_timeout: Duration) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            eviction_timeout,
            busy_timeout,
        }
    }

    pub fn from_config(config: &TrackerConfig) -> Self {
        Self::new(config.eviction_timeout, config.busy_timeout)
    }

    /// Creates a peer record in Idle, or replaces the inventory of an
    /// existing one while keeping its status.
    ///
    /// # Errors
    /// - `TrackerError::InvalidRegistration` - Port zero, mismatched
    ///   `files`/`file_sizes` lengths, bad filenames or sizes that contradict
    ///   a published descriptor
    pub fn register(
        &self,
        peer: PeerKey,
        files: &[String],
        file_sizes: &[u64],
    ) -> Result<(), TrackerError> {
        if peer.address().port() == 0 {
            return Err(TrackerError::InvalidRegistration {
                reason: "port must be non-zero".to_string(),
            });
        }

        if files.len() != file_sizes.len() {
            return Err(TrackerError::InvalidRegistration {
                reason: format!(
                    "{} files but {} sizes",
                    files.len(),
                    file_sizes.len()
                ),
            });
        }

        if let Some(bad) = files.iter().find(|name| !is_valid_filename(name)) {
            return Err(TrackerError::InvalidRegistration {
                reason: format!("invalid filename {bad:?}"),
            });
        }

        let mut state = self.state.write();

        // Validate all sizes before touching the catalog so a rejected
        // registration leaves no partial state behind.
        for (name, &size) in files.iter().zip(file_sizes) {
            if let Some(descriptor) = state.catalog.descriptor(name)
                && descriptor.total_size != size
            {
                return Err(TrackerError::InvalidRegistration {
                    reason: format!(
                        "{name} is {size} bytes but its descriptor says {}",
                        descriptor.total_size
                    ),
                });
            }
        }
        for (name, &size) in files.iter().zip(file_sizes) {
            state.catalog.record_size(name, size)?;
        }

        let now = Instant::now();
        let inventory: BTreeSet<String> = files.iter().cloned().collect();
        let replaced = match state.peers.get_mut(&peer) {
            // A reservation outlives re-registration; only completion or the
            // busy timeout ends it.
            Some(record) => {
                record.files = inventory;
                record.last_heartbeat = now;
                true
            }
            None => {
                state.peers.insert(
                    peer,
                    PeerRecord {
                        key: peer,
                        status: PeerStatus::Idle,
                        files: inventory,
                        last_heartbeat: now,
                        busy_since: None,
                        registered_at: Utc::now(),
                    },
                );
                false
            }
        };

        tracing::info!(peer = %peer, files = files.len(), replaced, "Peer registered");
        Ok(())
    }

    /// Refreshes a peer's liveness timestamp.
    ///
    /// # Errors
    /// - `TrackerError::NotRegistered` - Unknown peer
    pub fn heartbeat(&self, peer: PeerKey) -> Result<(), TrackerError> {
        let mut state = self.state.write();
        let record = state
            .peers
            .get_mut(&peer)
            .ok_or(TrackerError::NotRegistered { peer })?;
        record.last_heartbeat = Instant::now();
        tracing::trace!(peer = %peer, "Heartbeat");
        Ok(())
    }

    /// Removes a peer on its own request.
    ///
    /// # Errors
    /// - `TrackerError::NotRegistered` - Unknown peer
    pub fn disconnect(&self, peer: PeerKey) -> Result<(), TrackerError> {
        self.state
            .write()
            .peers
            .remove(&peer)
            .ok_or(TrackerError::NotRegistered { peer })?;
        tracing::info!(peer = %peer, "Peer disconnected");
        Ok(())
    }

    /// Idle peers in key order, skipping `excluding`, at most `limit`.
    pub fn list_idle(&self, excluding: Option<PeerKey>, limit: usize) -> Vec<PeerRecord> {
        self.state
            .read()
            .peers
            .values()
            .filter(|record| record.is_idle() && Some(record.key) != excluding)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Idle holders of each requested file, in key order.
    ///
    /// Every requested name appears in the result, with an empty list when
    /// nobody idle holds it.
    pub fn list_idle_holders(
        &self,
        filenames: &BTreeSet<String>,
    ) -> BTreeMap<String, Vec<PeerRecord>> {
        let state = self.state.read();
        filenames
            .iter()
            .map(|name| {
                let holders = state
                    .peers
                    .values()
                    .filter(|record| record.is_idle() && record.holds(name))
                    .cloned()
                    .collect();
                (name.clone(), holders)
            })
            .collect()
    }

    /// Answers GetIdlePeers: exactly `count` idle peers other than the requester.
    ///
    /// # Errors
    /// - `TrackerError::NotEnoughPeers` - Fewer than `count` idle peers
    pub fn idle_peers(&self, requester: PeerKey, count: usize) -> Result<Vec<PeerKey>, TrackerError> {
        let idle: Vec<PeerKey> = self
            .list_idle(Some(requester), count)
            .into_iter()
            .map(|record| record.key)
            .collect();

        if idle.len() < count {
            return Err(TrackerError::NotEnoughPeers {
                requested: count,
                matched: idle.len(),
            });
        }
        Ok(idle)
    }

    /// Matches requested files to distinct idle holders and reserves them.
    ///
    /// The requester is never a candidate. Reservation is all-or-nothing:
    /// when some file cannot be matched nobody is marked Busy.
    ///
    /// # Errors
    /// - `TrackerError::NotEnoughPeers` - Maximum matching smaller than the request
    pub fn assign_files(
        &self,
        requester: Option<PeerKey>,
        filenames: &[String],
    ) -> Result<FileAssignment, TrackerError> {
        let requested: BTreeSet<String> = filenames.iter().cloned().collect();
        let mut state = self.state.write();

        let holders: BTreeMap<String, BTreeSet<PeerKey>> = requested
            .iter()
            .map(|name| {
                let candidates = state
                    .peers
                    .values()
                    .filter(|record| {
                        record.is_idle() && record.holds(name) && Some(record.key) != requester
                    })
                    .map(|record| record.key)
                    .collect();
                (name.clone(), candidates)
            })
            .collect();

        let assignment = compute_assignment(&holders);
        if !assignment.is_complete() {
            tracing::debug!(
                requested = requested.len(),
                matched = assignment.matched.len(),
                unmatched = ?assignment.unmatched,
                "Not enough idle peers"
            );
            return Err(TrackerError::NotEnoughPeers {
                requested: requested.len(),
                matched: assignment.matched.len(),
            });
        }

        let now = Instant::now();
        for peer in assignment.matched.values() {
            if let Some(record) = state.peers.get_mut(peer) {
                record.status = PeerStatus::Busy;
                record.busy_since = Some(now);
            }
        }

        let reserved: BTreeSet<PeerKey> = assignment.matched.values().copied().collect();
        let alternates = holders
            .iter()
            .map(|(name, candidates)| {
                let others = candidates
                    .iter()
                    .filter(|peer| !reserved.contains(peer))
                    .copied()
                    .collect();
                (name.clone(), others)
            })
            .collect();

        let file_sizes = requested
            .iter()
            .filter_map(|name| state.catalog.size(name).map(|size| (name.clone(), size)))
            .collect();

        tracing::info!(
            requester = ?requester.map(|key| key.to_string()),
            assignment = ?assignment.matched,
            "Assigned files"
        );

        Ok(FileAssignment {
            peers: assignment.matched,
            alternates,
            file_sizes,
        })
    }

    /// Answers RequestFile: reserves one specific peer for one file.
    ///
    /// # Errors
    /// - `TrackerError::NotRegistered` - Unknown target
    /// - `TrackerError::UnknownFile` - Target does not hold the file
    /// - `TrackerError::PeerBusy` - Target is serving someone else
    pub fn request_file(&self, target: PeerKey, filename: &str) -> Result<PeerKey, TrackerError> {
        let mut state = self.state.write();
        let record = state
            .peers
            .get_mut(&target)
            .ok_or(TrackerError::NotRegistered { peer: target })?;

        if !record.holds(filename) {
            return Err(TrackerError::UnknownFile {
                filename: filename.to_string(),
            });
        }
        if !record.is_idle() {
            return Err(TrackerError::PeerBusy { peer: target });
        }

        record.status = PeerStatus::Busy;
        record.busy_since = Some(Instant::now());
        tracing::debug!(peer = %target, file = %filename, "Peer reserved for direct request");
        Ok(target)
    }

    /// Marks a peer Busy outside of assignment.
    ///
    /// # Errors
    /// - `TrackerError::NotRegistered` - Unknown peer
    pub fn mark_busy(&self, peer: PeerKey) -> Result<(), TrackerError> {
        let mut state = self.state.write();
        let record = state
            .peers
            .get_mut(&peer)
            .ok_or(TrackerError::NotRegistered { peer })?;
        if record.status == PeerStatus::Idle {
            record.status = PeerStatus::Busy;
            record.busy_since = Some(Instant::now());
        }
        Ok(())
    }

    /// Returns a peer to Idle.
    ///
    /// # Errors
    /// - `TrackerError::NotRegistered` - Unknown peer
    pub fn mark_idle(&self, peer: PeerKey) -> Result<(), TrackerError> {
        let mut state = self.state.write();
        let record = state
            .peers
            .get_mut(&peer)
            .ok_or(TrackerError::NotRegistered { peer })?;
        record.status = PeerStatus::Idle;
        record.busy_since = None;
        Ok(())
    }

    /// Handles a completion notice for a peer that finished serving.
    ///
    /// # Errors
    /// - `TrackerError::NotRegistered` - Peer was evicted or never registered
    pub fn complete_transfer(&self, peer: PeerKey) -> Result<(), TrackerError> {
        self.mark_idle(peer)?;
        tracing::info!(peer = %peer, "Transfer complete, peer idle");
        Ok(())
    }

    /// Stores a file descriptor in the catalog.
    ///
    /// # Errors
    /// - `TrackerError::InvalidRegistration` - Descriptor breaks its own layout rules
    /// - `TrackerError::DescriptorConflict` - Different layout already published
    pub fn publish_descriptor(&self, descriptor: FileDescriptor) -> Result<bool, TrackerError> {
        descriptor
            .validate()
            .map_err(|e| TrackerError::InvalidRegistration {
                reason: e.to_string(),
            })?;
        let name = descriptor.name.clone();
        let stored = self.state.write().catalog.publish(descriptor)?;
        if stored {
            tracing::info!(file = %name, "Descriptor published");
        }
        Ok(stored)
    }

    /// Looks up a published descriptor.
    ///
    /// # Errors
    /// - `TrackerError::UnknownFile` - Nothing published under this name
    pub fn descriptor(&self, filename: &str) -> Result<Arc<FileDescriptor>, TrackerError> {
        self.state
            .read()
            .catalog
            .descriptor(filename)
            .ok_or_else(|| TrackerError::UnknownFile {
                filename: filename.to_string(),
            })
    }

    /// Tracked files with the number of registered peers holding each.
    pub fn files(&self) -> Vec<TrackedFile> {
        let state = self.state.read();
        state
            .catalog
            .files()
            .map(|mut file| {
                file.holders = state
                    .peers
                    .values()
                    .filter(|record| record.holds(&file.name))
                    .count();
                file
            })
            .collect()
    }

    pub fn peer(&self, peer: PeerKey) -> Option<PeerRecord> {
        self.state.read().peers.get(&peer).cloned()
    }

    /// All records in key order.
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.state.read().peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().peers.is_empty()
    }

    /// Removes peers whose last heartbeat is older than the eviction timeout.
    pub fn evict(&self) -> Vec<PeerKey> {
        let now = Instant::now();
        let mut state = self.state.write();

        let stale: Vec<PeerKey> = state
            .peers
            .values()
            .filter(|record| now.duration_since(record.last_heartbeat) > self.eviction_timeout)
            .map(|record| record.key)
            .collect();

        for peer in &stale {
            state.peers.remove(peer);
            tracing::warn!(peer = %peer, "Peer evicted");
        }
        stale
    }

    /// Returns peers that stayed Busy longer than the busy timeout to Idle.
    pub fn release_stale_busy(&self) -> Vec<PeerKey> {
        let now = Instant::now();
        let mut state = self.state.write();
        let mut released = Vec::new();

        for record in state.peers.values_mut() {
            if let Some(since) = record.busy_since
                && now.duration_since(since) > self.busy_timeout
            {
                record.status = PeerStatus::Idle;
                record.busy_since = None;
                released.push(record.key);
                tracing::warn!(peer = %record.key, "Busy peer force-released");
            }
        }
        released
    }

    /// One liveness pass: eviction, then busy force-release.
    pub fn sweep(&self) -> SweepOutcome {
        SweepOutcome {
            evicted: self.evict(),
            released: self.release_stale_busy(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> PeerKey {
        PeerKey::new(s.parse().unwrap())
    }

    fn registry() -> PeerRegistry {
        PeerRegistry::new(Duration::from_secs(60), Duration::from_secs(300))
    }

    fn names(files: &[&str]) -> Vec<String> {
        files.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_register_lists_peer_as_idle_holder() {
        let registry = registry();
        let a = key("10.0.0.1:7001");
        registry.register(a, &names(&["f1"]), &[2048]).unwrap();

        let holders = registry.list_idle_holders(&BTreeSet::from(["f1".to_string()]));
        assert_eq!(holders["f1"].len(), 1);
        assert_eq!(holders["f1"][0].key, a);
        assert_eq!(holders["f1"][0].status, PeerStatus::Idle);
    }

    #[test]
    fn test_files_count_current_holders() {
        let registry = registry();
        let a = key("10.0.0.1:7001");
        let b = key("10.0.0.2:7001");
        registry.register(a, &names(&["f1", "f2"]), &[10, 20]).unwrap();
        registry.register(b, &names(&["f1"]), &[10]).unwrap();
        registry.disconnect(a).unwrap();

        let files = registry.files();
        assert_eq!(files.len(), 2);
        assert_eq!((files[0].name.as_str(), files[0].holders), ("f1", 1));
        assert_eq!((files[1].name.as_str(), files[1].size), ("f2", 20));
        assert_eq!(files[1].holders, 0);
    }

    #[test]
    fn test_register_validation() {
        let registry = registry();
        let a = key("10.0.0.1:7001");

        assert!(matches!(
            registry.register(a, &names(&["f1", "f2"]), &[1]),
            Err(TrackerError::InvalidRegistration { .. })
        ));
        assert!(matches!(
            registry.register(a, &names(&["../f1"]), &[1]),
            Err(TrackerError::InvalidRegistration { .. })
        ));
        assert!(matches!(
            registry.register(key("10.0.0.1:0"), &names(&["f1"]), &[1]),
            Err(TrackerError::InvalidRegistration { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_rejects_size_contradicting_descriptor() {
        let registry = registry();
        let descriptor = FileDescriptor::from_bytes("f1", b"0123456789", 4).unwrap();
        registry.publish_descriptor(descriptor).unwrap();

        let a = key("10.0.0.1:7001");
        assert!(matches!(
            registry.register(a, &names(&["f1"]), &[11]),
            Err(TrackerError::InvalidRegistration { .. })
        ));
        registry.register(a, &names(&["f1"]), &[10]).unwrap();
    }

    #[test]
    fn test_reregistration_replaces_inventory_and_keeps_status() {
        let registry = registry();
        let a = key("10.0.0.1:7001");
        registry.register(a, &names(&["f1"]), &[1]).unwrap();
        registry.mark_busy(a).unwrap();

        registry.register(a, &names(&["f2"]), &[2]).unwrap();
        let record = registry.peer(a).unwrap();
        assert_eq!(record.status, PeerStatus::Busy);
        assert!(record.busy_since.is_some());
        assert!(record.holds("f2"));
        assert!(!record.holds("f1"));
        assert_eq!(registry.len(), 1);

        registry.complete_transfer(a).unwrap();
        assert!(registry.peer(a).unwrap().is_idle());
    }

    #[test]
    fn test_reserved_peer_is_not_assigned_again_after_reregistering() {
        let registry = registry();
        let a = key("10.0.0.1:7001");
        registry.register(a, &names(&["f1"]), &[10]).unwrap();

        let first = registry.assign_files(None, &names(&["f1"])).unwrap();
        assert_eq!(first.peers["f1"], a);

        registry.register(a, &names(&["f1", "f9"]), &[10, 20]).unwrap();
        assert!(matches!(
            registry.assign_files(None, &names(&["f1"])),
            Err(TrackerError::NotEnoughPeers {
                requested: 1,
                matched: 0
            })
        ));
    }

    #[test]
    fn test_heartbeat_and_disconnect_require_registration() {
        let registry = registry();
        let a = key("10.0.0.1:7001");

        assert!(matches!(
            registry.heartbeat(a),
            Err(TrackerError::NotRegistered { .. })
        ));
        registry.register(a, &[], &[]).unwrap();
        registry.heartbeat(a).unwrap();
        registry.disconnect(a).unwrap();
        assert!(matches!(
            registry.disconnect(a),
            Err(TrackerError::NotRegistered { .. })
        ));
    }

    #[test]
    fn test_idle_peers_excludes_requester() {
        let registry = registry();
        let a = key("10.0.0.1:7001");
        let b = key("10.0.0.2:7001");
        let c = key("10.0.0.3:7001");
        for peer in [a, b, c] {
            registry.register(peer, &[], &[]).unwrap();
        }
        registry.mark_busy(c).unwrap();

        assert_eq!(registry.idle_peers(a, 1).unwrap(), vec![b]);
        assert!(matches!(
            registry.idle_peers(a, 2),
            Err(TrackerError::NotEnoughPeers {
                requested: 2,
                matched: 1
            })
        ));
    }

    #[test]
    fn test_assignment_reserves_distinct_peers() {
        let registry = registry();
        let a = key("10.0.0.1:7001");
        let b = key("10.0.0.2:7001");
        registry.register(a, &names(&["f2"]), &[100]).unwrap();
        registry.register(b, &names(&["f2"]), &[100]).unwrap();

        let first = registry.assign_files(None, &names(&["f2"])).unwrap();
        let second = registry.assign_files(None, &names(&["f2"])).unwrap();
        assert_ne!(first.peers["f2"], second.peers["f2"]);
        assert_eq!(first.file_sizes["f2"], 100);
        assert_eq!(first.alternates["f2"], vec![b]);

        assert!(matches!(
            registry.assign_files(None, &names(&["f2"])),
            Err(TrackerError::NotEnoughPeers { .. })
        ));
    }

    #[test]
    fn test_partial_assignment_reserves_nothing() {
        let registry = registry();
        let a = key("10.0.0.1:7001");
        registry.register(a, &names(&["f1"]), &[1]).unwrap();

        assert!(registry.assign_files(None, &names(&["f1", "f9"])).is_err());
        assert!(registry.peer(a).unwrap().is_idle());
    }

    #[test]
    fn test_requester_is_never_assigned_to_itself() {
        let registry = registry();
        let a = key("10.0.0.1:7001");
        registry.register(a, &names(&["f1"]), &[1]).unwrap();

        assert!(registry.assign_files(Some(a), &names(&["f1"])).is_err());
        assert!(registry.assign_files(None, &names(&["f1"])).is_ok());
    }

    #[test]
    fn test_request_file_and_completion() {
        let registry = registry();
        let a = key("10.0.0.1:7001");
        registry.register(a, &names(&["f1"]), &[1]).unwrap();

        assert!(matches!(
            registry.request_file(a, "f2"),
            Err(TrackerError::UnknownFile { .. })
        ));
        assert_eq!(registry.request_file(a, "f1").unwrap(), a);
        assert!(matches!(
            registry.request_file(a, "f1"),
            Err(TrackerError::PeerBusy { .. })
        ));

        registry.complete_transfer(a).unwrap();
        assert!(registry.peer(a).unwrap().is_idle());
        assert!(matches!(
            registry.complete_transfer(key("10.0.0.9:1")),
            Err(TrackerError::NotRegistered { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_removes_silent_peers() {
        let registry = registry();
        let a = key("10.0.0.1:7001");
        let b = key("10.0.0.2:7001");
        registry.register(a, &names(&["f1"]), &[1]).unwrap();
        registry.register(b, &names(&["f1"]), &[1]).unwrap();

        tokio::time::advance(Duration::from_secs(45)).await;
        registry.heartbeat(b).unwrap();
        assert!(registry.evict().is_empty());

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(registry.evict(), vec![a]);

        let holders = registry.list_idle_holders(&BTreeSet::from(["f1".to_string()]));
        assert_eq!(holders["f1"].len(), 1);
        assert_eq!(holders["f1"][0].key, b);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_force_releases_stuck_busy_peers() {
        let registry = PeerRegistry::new(Duration::from_secs(600), Duration::from_secs(30));
        let a = key("10.0.0.1:7001");
        registry.register(a, &names(&["f1"]), &[1]).unwrap();
        registry.assign_files(None, &names(&["f1"])).unwrap();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(registry.sweep().released.is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        let outcome = registry.sweep();
        assert_eq!(outcome.released, vec![a]);
        assert!(outcome.evicted.is_empty());
        assert!(registry.peer(a).unwrap().is_idle());
    }
}
