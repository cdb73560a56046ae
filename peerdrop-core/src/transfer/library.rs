//! Files a peer offers to others.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use super::{FileDescriptor, PieceIndex, TransferError};

#[derive(Debug, Clone)]
struct SharedFile {
    path: PathBuf,
    descriptor: Arc<FileDescriptor>,
}

/// Local files available for serving, keyed by filename.
///
/// Descriptors are computed when a file is first shared and reused for every
/// later request, so piece hashing happens once per file.
#[derive(Debug, Default)]
pub struct SharedLibrary {
    files: RwLock<BTreeMap<String, SharedFile>>,
}

impl SharedLibrary {
    /// Creates an empty library.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shares a file from disk, hashing it on the first call.
    ///
    /// # Errors
    /// - `TransferError::Io` - File missing or unreadable
    /// - `TransferError::InvalidDescriptor` - Unusable filename or piece size
    pub async fn share_file(
        &self,
        path: &Path,
        piece_size: u32,
    ) -> Result<Arc<FileDescriptor>, TransferError> {
        let name = path.file_name().and_then(|name| name.to_str());
        if let Some(name) = name
            && let Some(existing) = self.files.read().get(name)
            && existing.path == path
        {
            return Ok(existing.descriptor.clone());
        }

        let descriptor = FileDescriptor::from_file(path, piece_size).await?;
        Ok(self.insert(path.to_path_buf(), descriptor))
    }

    /// Shares a file whose descriptor is already known (e.g. a finished download).
    pub fn insert(&self, path: PathBuf, descriptor: FileDescriptor) -> Arc<FileDescriptor> {
        let descriptor = Arc::new(descriptor);
        tracing::info!(
            file = %descriptor.name,
            pieces = descriptor.piece_count(),
            path = %path.display(),
            "Sharing file"
        );
        self.files.write().insert(
            descriptor.name.clone(),
            SharedFile {
                path,
                descriptor: descriptor.clone(),
            },
        );
        descriptor
    }

    /// Returns the descriptor of a shared file.
    pub fn descriptor(&self, filename: &str) -> Option<Arc<FileDescriptor>> {
        self.files
            .read()
            .get(filename)
            .map(|file| file.descriptor.clone())
    }

    /// Lists shared filenames with their sizes, in name order.
    pub fn inventory(&self) -> Vec<(String, u64)> {
        self.files
            .read()
            .values()
            .map(|file| (file.descriptor.name.clone(), file.descriptor.total_size))
            .collect()
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.files.read().contains_key(filename)
    }

    /// Reads one piece from disk.
    ///
    /// # Errors
    /// - `TransferError::FileNotFound` - File not shared
    /// - `TransferError::InvalidPieceIndex` - Index beyond the last piece
    /// - `TransferError::Io` - File shrank or became unreadable
    pub async fn read_piece(&self, filename: &str, index: PieceIndex) -> Result<Bytes, TransferError> {
        let file = self
            .files
            .read()
            .get(filename)
            .cloned()
            .ok_or_else(|| TransferError::FileNotFound {
                filename: filename.to_string(),
            })?;

        let range = file
            .descriptor
            .piece_range(index)
            .ok_or_else(|| TransferError::InvalidPieceIndex {
                filename: filename.to_string(),
                index,
            })?;

        let mut handle = File::open(&file.path).await?;
        handle.seek(SeekFrom::Start(range.start)).await?;

        let mut data = BytesMut::zeroed((range.end - range.start) as usize);
        handle.read_exact(&mut data).await?;
        Ok(data.freeze())
    }
}
