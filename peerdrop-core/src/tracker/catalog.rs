//! Per-file metadata known to the tracker.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::TrackerError;
use crate::transfer::FileDescriptor;

#[derive(Debug, Clone, Default)]
struct CatalogEntry {
    size: u64,
    descriptor: Option<Arc<FileDescriptor>>,
}

/// One row of the tracked-file listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFile {
    pub name: String,
    pub size: u64,
    /// Registered peers currently advertising the file.
    pub holders: usize,
    /// Whether a descriptor has been published.
    pub described: bool,
}

/// File sizes reported at registration plus descriptors published later.
///
/// A descriptor, once published, is immutable: a second publish of the same
/// name must carry an identical piece layout.
#[derive(Debug, Default)]
pub struct FileCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl FileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the size a registering peer reports for a file.
    ///
    /// # Errors
    /// - `TrackerError::InvalidRegistration` - Size disagrees with the
    ///   published descriptor
    pub fn record_size(&mut self, filename: &str, size: u64) -> Result<(), TrackerError> {
        let entry = self.entries.entry(filename.to_string()).or_default();

        if let Some(descriptor) = &entry.descriptor
            && descriptor.total_size != size
        {
            return Err(TrackerError::InvalidRegistration {
                reason: format!(
                    "{filename} is {size} bytes but its descriptor says {}",
                    descriptor.total_size
                ),
            });
        }

        entry.size = size;
        Ok(())
    }

    /// Stores a descriptor if none is known for the name yet.
    ///
    /// Returns true when the descriptor was newly stored and false when an
    /// identical one was already present.
    ///
    /// # Errors
    /// - `TrackerError::DescriptorConflict` - Another layout is already published
    pub fn publish(&mut self, descriptor: FileDescriptor) -> Result<bool, TrackerError> {
        let entry = self.entries.entry(descriptor.name.clone()).or_default();

        if let Some(existing) = &entry.descriptor {
            if same_layout(existing, &descriptor) {
                return Ok(false);
            }
            return Err(TrackerError::DescriptorConflict {
                filename: descriptor.name,
            });
        }

        entry.size = descriptor.total_size;
        entry.descriptor = Some(Arc::new(descriptor));
        Ok(true)
    }

    pub fn descriptor(&self, filename: &str) -> Option<Arc<FileDescriptor>> {
        self.entries
            .get(filename)
            .and_then(|entry| entry.descriptor.clone())
    }

    pub fn size(&self, filename: &str) -> Option<u64> {
        self.entries.get(filename).map(|entry| entry.size)
    }

    /// Every file ever registered or published, in name order. `holders`
    /// is left at zero; the catalog does not track peers.
    pub fn files(&self) -> impl Iterator<Item = TrackedFile> + '_ {
        self.entries.iter().map(|(name, entry)| TrackedFile {
            name: name.clone(),
            size: entry.size,
            holders: 0,
            described: entry.descriptor.is_some(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// The tracker address a publisher embeds is local bookkeeping, not layout.
fn same_layout(a: &FileDescriptor, b: &FileDescriptor) -> bool {
    a.name == b.name
        && a.total_size == b.total_size
        && a.piece_size == b.piece_size
        && a.piece_hashes == b.piece_hashes
}
