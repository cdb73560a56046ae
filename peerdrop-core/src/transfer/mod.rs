//! Peer-to-peer piece transfer.
//!
//! Files are split into fixed-size pieces, each verified against the SHA-1
//! hash recorded in the file's descriptor. A requesting peer opens one
//! connection per piece, asks for `(filename, piece index)` and reads exactly
//! the declared number of bytes back.

pub mod codec;
pub mod descriptor;
pub mod fetcher;
pub mod library;
pub mod server;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

pub use codec::{PieceRequest, ResponseStatus};
pub use descriptor::{FileDescriptor, PieceHash};
pub use fetcher::{PieceFetcher, TcpPieceFetcher, fetch_verified_piece};
pub use library::SharedLibrary;
pub use server::{PieceServer, PieceServerHandle};

/// Zero-based index of a piece within a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur while describing, serving or fetching pieces.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("File {filename} not found")]
    FileNotFound { filename: String },

    #[error("Piece {index} is out of range for {filename}")]
    InvalidPieceIndex { filename: String, index: PieceIndex },

    #[error("Piece {index} from {peer} failed hash verification")]
    PieceIntegrity { index: PieceIndex, peer: SocketAddr },

    #[error("Transfer of piece {index} from {peer} failed: {reason}")]
    PieceTransfer {
        index: PieceIndex,
        peer: SocketAddr,
        reason: String,
    },

    #[error("Piece {index} from {peer} timed out after {timeout:?}")]
    Timeout {
        index: PieceIndex,
        peer: SocketAddr,
        timeout: Duration,
    },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Invalid descriptor: {reason}")]
    InvalidDescriptor { reason: String },

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("Descriptor encoding error")]
    Json(#[from] serde_json::Error),
}

/// Checks that a filename names a single entry inside a directory.
///
/// Filenames travel between peers and are joined onto local directories, so
/// anything that could escape the directory is rejected.
pub fn is_valid_filename(filename: &str) -> bool {
    !filename.is_empty()
        && filename != "."
        && filename != ".."
        && !filename.contains(['/', '\\', '\0'])
        && filename.len() <= codec::MAX_FILENAME_LEN
}
