//! File descriptors: piece layout and expected piece hashes.
//!
//! A descriptor is created once, when a peer first shares a file, and never
//! changes afterwards. It is persisted as JSON in the form
//! `{filename, fileSize, pieceSize, pieceHashes, trackerAddress}`.

use std::fmt;
use std::ops::Range;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::codec::MAX_PIECE_LEN;
use super::{PieceIndex, TransferError, is_valid_filename};

/// SHA-1 hash of a single piece.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PieceHash([u8; 20]);

impl PieceHash {
    /// Creates PieceHash from a raw 20-byte digest.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Hashes piece content.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl TryFrom<String> for PieceHash {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let mut hash = [0u8; 20];
        hex::decode_to_slice(&value, &mut hash)
            .map_err(|e| format!("invalid piece hash {value:?}: {e}"))?;
        Ok(Self(hash))
    }
}

impl From<PieceHash> for String {
    fn from(hash: PieceHash) -> Self {
        hex::encode(hash.0)
    }
}

impl fmt::Display for PieceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PieceHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PieceHash({self})")
    }
}

/// Piece layout and expected hashes for one file.
///
/// `piece_hashes` always holds exactly `ceil(total_size / piece_size)`
/// entries; every piece except possibly the last is `piece_size` bytes long.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileDescriptor {
    #[serde(rename = "filename")]
    pub name: String,
    #[serde(rename = "fileSize")]
    pub total_size: u64,
    pub piece_size: u32,
    pub piece_hashes: Vec<PieceHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_address: Option<String>,
}

impl FileDescriptor {
    /// Creates a descriptor from already computed piece hashes.
    ///
    /// # Errors
    /// - `TransferError::InvalidDescriptor` - Bad filename, zero piece size or
    ///   a hash count that does not match the piece layout
    pub fn new(
        name: impl Into<String>,
        total_size: u64,
        piece_size: u32,
        piece_hashes: Vec<PieceHash>,
    ) -> Result<Self, TransferError> {
        let descriptor = Self {
            name: name.into(),
            total_size,
            piece_size,
            piece_hashes,
            tracker_address: None,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Describes in-memory content, hashing every piece.
    ///
    /// # Errors
    /// - `TransferError::InvalidDescriptor` - Bad filename or a piece size that
    ///   is zero or larger than a transfer frame allows
    pub fn from_bytes(
        name: impl Into<String>,
        data: &[u8],
        piece_size: u32,
    ) -> Result<Self, TransferError> {
        check_piece_size(piece_size)?;

        let piece_hashes = data.chunks(piece_size as usize).map(PieceHash::of).collect();
        Self::new(name, data.len() as u64, piece_size, piece_hashes)
    }

    /// Describes a file on disk, reading it piece by piece.
    ///
    /// # Errors
    /// - `TransferError::Io` - File missing or unreadable
    /// - `TransferError::InvalidDescriptor` - Path has no usable filename or
    ///   the piece size is zero or too large
    pub async fn from_file(path: &Path, piece_size: u32) -> Result<Self, TransferError> {
        check_piece_size(piece_size)?;

        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| TransferError::InvalidDescriptor {
                reason: format!("{} has no usable filename", path.display()),
            })?
            .to_string();

        let mut file = File::open(path).await?;
        let total_size = file.metadata().await?.len();
        let piece_count = total_size.div_ceil(u64::from(piece_size));

        let mut piece_hashes = Vec::with_capacity(piece_count as usize);
        let mut buffer = vec![0u8; piece_size as usize];
        let mut remaining = total_size;

        while remaining > 0 {
            let len = remaining.min(u64::from(piece_size)) as usize;
            file.read_exact(&mut buffer[..len]).await?;
            piece_hashes.push(PieceHash::of(&buffer[..len]));
            remaining -= len as u64;
        }

        tracing::debug!(
            file = %name,
            size = total_size,
            pieces = piece_hashes.len(),
            "Described file"
        );

        Self::new(name, total_size, piece_size, piece_hashes)
    }

    /// Records the tracker this descriptor was published to.
    pub fn with_tracker_address(mut self, tracker_address: impl Into<String>) -> Self {
        self.tracker_address = Some(tracker_address.into());
        self
    }

    /// Checks the layout invariants, used after decoding untrusted input.
    ///
    /// # Errors
    /// - `TransferError::InvalidDescriptor` - Any invariant is violated
    pub fn validate(&self) -> Result<(), TransferError> {
        if !is_valid_filename(&self.name) {
            return Err(TransferError::InvalidDescriptor {
                reason: format!("invalid filename {:?}", self.name),
            });
        }

        check_piece_size(self.piece_size)?;

        let expected = self.total_size.div_ceil(u64::from(self.piece_size));
        if self.piece_hashes.len() as u64 != expected {
            return Err(TransferError::InvalidDescriptor {
                reason: format!(
                    "{} declares {} hashes but {} bytes in {} byte pieces need {}",
                    self.name,
                    self.piece_hashes.len(),
                    self.total_size,
                    self.piece_size,
                    expected
                ),
            });
        }

        Ok(())
    }

    /// Number of pieces in the file.
    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Byte range covered by a piece, or None when out of range.
    pub fn piece_range(&self, index: PieceIndex) -> Option<Range<u64>> {
        if index.as_u32() >= self.piece_count() {
            return None;
        }

        let start = u64::from(index.as_u32()) * u64::from(self.piece_size);
        let end = (start + u64::from(self.piece_size)).min(self.total_size);
        Some(start..end)
    }

    /// Length in bytes of a piece, or None when out of range.
    pub fn piece_len(&self, index: PieceIndex) -> Option<u32> {
        self.piece_range(index)
            .map(|range| (range.end - range.start) as u32)
    }

    /// Returns true when `data` is exactly the expected content of the piece.
    pub fn verify_piece(&self, index: PieceIndex, data: &[u8]) -> bool {
        match self.piece_hashes.get(index.as_u32() as usize) {
            Some(expected) => {
                self.piece_len(index) == Some(data.len() as u32) && PieceHash::of(data) == *expected
            }
            None => false,
        }
    }

    /// Writes the descriptor as JSON.
    ///
    /// # Errors
    /// - `TransferError::Io` - File cannot be written
    pub async fn save(&self, path: &Path) -> Result<(), TransferError> {
        let json = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }

    /// Reads and validates a descriptor JSON file.
    ///
    /// # Errors
    /// - `TransferError::Io` - File missing or unreadable
    /// - `TransferError::Json` - Malformed JSON
    /// - `TransferError::InvalidDescriptor` - Layout invariants violated
    pub async fn load(path: &Path) -> Result<Self, TransferError> {
        let json = tokio::fs::read(path).await?;
        let descriptor: Self = serde_json::from_slice(&json)?;
        descriptor.validate()?;
        Ok(descriptor)
    }
}

fn check_piece_size(piece_size: u32) -> Result<(), TransferError> {
    if piece_size == 0 {
        return Err(TransferError::InvalidDescriptor {
            reason: "piece size must be positive".to_string(),
        });
    }
    if piece_size > MAX_PIECE_LEN {
        return Err(TransferError::InvalidDescriptor {
            reason: format!("piece size {piece_size} exceeds the {MAX_PIECE_LEN} byte limit"),
        });
    }
    Ok(())
}
