//! Single-file downloads from a set of candidate peers.
//!
//! A job fetches every piece of one descriptor, rarest first, with a bounded
//! number of concurrent fetches. Failed pieces are retried against other
//! candidates, then with backoff, until the per-piece budget runs out.

pub mod assembler;
pub mod rarity;
pub mod recovery;
pub mod scheduler;

use std::path::PathBuf;

pub use assembler::PieceAssembler;
pub use rarity::{Availability, Candidate, PiecePicker, RarestFirstPicker};
pub use recovery::{ErrorCategory, RecoveryTracker, RetryDecision, RetryPolicy, RetryStrategy};
pub use scheduler::{DownloadJob, DownloadReport, DownloadScheduler, JobHandle};

use crate::transfer::PieceIndex;

/// Errors that end a download job.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Download of {filename} incomplete: piece {index} failed {attempts} rounds of retries")]
    IncompleteTransfer {
        filename: String,
        index: PieceIndex,
        attempts: u32,
    },

    #[error("Download of {filename} was cancelled")]
    Cancelled { filename: String },

    #[error("No candidate peer offers piece {index} of {filename}")]
    NoCandidatePeers { filename: String, index: PieceIndex },

    #[error("Cannot write {path}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Download task for {filename} aborted: {reason}")]
    Aborted { filename: String, reason: String },
}

/// Receives `(downloaded, total)` piece counts as a job progresses.
pub trait ProgressObserver: Send + Sync {
    fn on_progress(&self, downloaded: u32, total: u32);
}

impl<F> ProgressObserver for F
where
    F: Fn(u32, u32) + Send + Sync,
{
    fn on_progress(&self, downloaded: u32, total: u32) {
        self(downloaded, total)
    }
}

/// Observer that ignores progress.
pub struct NoProgress;

impl ProgressObserver for NoProgress {
    fn on_progress(&self, _downloaded: u32, _total: u32) {}
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_closure_observer() {
        let seen = Mutex::new(Vec::new());
        let observer = |downloaded: u32, total: u32| seen.lock().unwrap().push((downloaded, total));
        observer.on_progress(1, 3);
        observer.on_progress(2, 3);
        assert_eq!(*seen.lock().unwrap(), vec![(1, 3), (2, 3)]);
    }
}
