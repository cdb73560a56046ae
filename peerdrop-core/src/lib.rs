//! Peerdrop Core - tracker-coordinated peer-to-peer file distribution
//!
//! A central tracker knows which peers are alive, which files they hold and
//! whether they are busy. Requesters ask it for one idle holder per file,
//! then pull verified pieces straight from those peers.

pub mod config;
pub mod download;
pub mod peer;
pub mod tracing_setup;
pub mod tracker;
pub mod transfer;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_fixtures;

// Re-export main types for convenient access
pub use config::PeerdropConfig;
pub use download::{DownloadError, DownloadScheduler};
pub use peer::PeerNode;
pub use tracker::{PeerRegistry, Tracker, TrackerError};
pub use transfer::{FileDescriptor, TransferError};

/// Errors that can bubble up from any Peerdrop subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PeerdropError {
    #[error("Tracker error: {0}")]
    Tracker(#[from] TrackerError),

    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("Download error: {0}")]
    Download(#[from] DownloadError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PeerdropError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            PeerdropError::Tracker(e) => match e {
                TrackerError::NotEnoughPeers { requested, matched } => {
                    format!("Only {matched} of {requested} files have an idle peer right now")
                }
                TrackerError::TrackerTimeout { url } => {
                    format!("Could not reach tracker: {url}")
                }
                TrackerError::Http(_) => "Could not reach tracker".to_string(),
                TrackerError::UnknownFile { filename } => {
                    format!("No peer shares {filename}")
                }
                TrackerError::InvalidRegistration { reason } => {
                    format!("Tracker rejected registration: {reason}")
                }
                _ => "Tracker error occurred".to_string(),
            },
            PeerdropError::Transfer(TransferError::InvalidDescriptor { reason }) => {
                format!("Invalid file descriptor: {reason}")
            }
            PeerdropError::Transfer(_) => "Transfer error occurred".to_string(),
            PeerdropError::Download(e) => match e {
                DownloadError::IncompleteTransfer { filename, .. } => {
                    format!("Could not download {filename}: peers kept failing")
                }
                DownloadError::Cancelled { filename } => format!("Download of {filename} cancelled"),
                _ => "Download error occurred".to_string(),
            },
            PeerdropError::Configuration { .. } => "Configuration error occurred".to_string(),
            PeerdropError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            PeerdropError::Configuration { .. }
                | PeerdropError::Tracker(TrackerError::InvalidRegistration { .. })
                | PeerdropError::Tracker(TrackerError::UnknownFile { .. })
                | PeerdropError::Transfer(TransferError::InvalidDescriptor { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, PeerdropError>;
