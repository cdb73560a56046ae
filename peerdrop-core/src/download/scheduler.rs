//! Drives one file download to completion.
//!
//! Every piece index is in exactly one place at a time: pending in the
//! picker, in flight, waiting out a backoff delay, or downloaded. The
//! dispatch loop only takes new work from the picker while fewer than
//! `concurrency` fetches are running.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::Instant;
use uuid::Uuid;

use super::assembler::PieceAssembler;
use super::rarity::{Candidate, PiecePicker, RarestFirstPicker};
use super::recovery::{ErrorCategory, RecoveryTracker, RetryDecision, RetryPolicy};
use super::{DownloadError, ProgressObserver};
use crate::config::TransferConfig;
use crate::transfer::{FileDescriptor, PieceFetcher, PieceIndex, TransferError, fetch_verified_piece};

/// One file to fetch from a fixed set of candidates.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub id: Uuid,
    pub descriptor: Arc<FileDescriptor>,
    pub candidates: Vec<Candidate>,
    pub destination: PathBuf,
}

impl DownloadJob {
    pub fn new(
        descriptor: Arc<FileDescriptor>,
        candidates: Vec<Candidate>,
        destination: PathBuf,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            descriptor,
            candidates,
            destination,
        }
    }
}

/// Summary of a finished job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub job_id: Uuid,
    pub filename: String,
    pub destination: PathBuf,
    pub bytes: u64,
    pub pieces: u32,
    /// Peers that delivered at least one verified piece.
    pub served_by: BTreeSet<SocketAddr>,
    pub elapsed: Duration,
}

/// Handle to a job running in the background.
pub struct JobHandle {
    id: Uuid,
    filename: String,
    cancel: watch::Sender<bool>,
    task: JoinHandle<Result<DownloadReport, DownloadError>>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Stops dispatching and aborts in-flight fetches. The job then
    /// reports `DownloadError::Cancelled`.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Waits for the job to end.
    ///
    /// # Errors
    /// - Any error the job ended with
    /// - `DownloadError::Aborted` - Job task panicked or was aborted
    pub async fn wait(self) -> Result<DownloadReport, DownloadError> {
        let filename = self.filename;
        self.task
            .await
            .map_err(|e| aborted(&filename, &e))?
    }
}

/// Runs download jobs against a piece fetcher.
#[derive(Clone)]
pub struct DownloadScheduler {
    fetcher: Arc<dyn PieceFetcher>,
    concurrency: usize,
    policy: RetryPolicy,
    temp_suffix: String,
}

type FetchOutcome = (PieceIndex, SocketAddr, Result<Bytes, TransferError>);

impl DownloadScheduler {
    pub fn new(fetcher: Arc<dyn PieceFetcher>, config: &TransferConfig) -> Self {
        Self {
            fetcher,
            concurrency: config.fetch_concurrency.max(1),
            policy: RetryPolicy::from_config(config),
            temp_suffix: config.temp_file_suffix.to_string(),
        }
    }

    /// Overrides the retry policy taken from configuration.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Starts a job in the background.
    pub fn start(&self, job: DownloadJob, observer: Arc<dyn ProgressObserver>) -> JobHandle {
        let (cancel, cancel_rx) = watch::channel(false);
        let id = job.id;
        let filename = job.descriptor.name.clone();
        let scheduler = self.clone();

        let task = tokio::spawn(async move { scheduler.run(job, observer, cancel_rx).await });

        JobHandle {
            id,
            filename,
            cancel,
            task,
        }
    }

    /// Runs a job on the current task until it completes, fails or is
    /// cancelled through `cancel`.
    ///
    /// # Errors
    /// - `DownloadError::NoCandidatePeers` - Some piece has no candidate
    /// - `DownloadError::IncompleteTransfer` - A piece exhausted its retries
    /// - `DownloadError::Cancelled` - `cancel` was set to true
    /// - `DownloadError::Storage` - Destination could not be written
    pub async fn run(
        &self,
        job: DownloadJob,
        observer: Arc<dyn ProgressObserver>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<DownloadReport, DownloadError> {
        let started = Instant::now();
        let descriptor = Arc::clone(&job.descriptor);
        let filename = descriptor.name.clone();
        let total = descriptor.piece_count();

        let mut picker = RarestFirstPicker::new(total, &job.candidates);
        if let Some(index) = picker.unavailable_piece() {
            return Err(DownloadError::NoCandidatePeers { filename, index });
        }

        let mut assembler =
            PieceAssembler::create(&descriptor, &job.destination, &self.temp_suffix).await?;
        let mut recovery = RecoveryTracker::new(self.policy.clone());

        let mut in_flight: JoinSet<FetchOutcome> = JoinSet::new();
        let mut in_flight_pieces: BTreeSet<PieceIndex> = BTreeSet::new();
        let mut backoff: JoinSet<PieceIndex> = JoinSet::new();
        let mut downloaded: BTreeSet<PieceIndex> = BTreeSet::new();
        let mut served_by = BTreeSet::new();
        let mut cursor = 0usize;

        tracing::info!(
            job = %job.id,
            file = %filename,
            pieces = total,
            candidates = job.candidates.len(),
            concurrency = self.concurrency,
            "Download started"
        );

        let failure = loop {
            let mut stalled = None;
            while in_flight.len() < self.concurrency {
                let Some(index) = picker.next_piece() else {
                    break;
                };
                let Some(peer) = select_peer(&job.candidates, index, &recovery, &mut cursor) else {
                    stalled = Some(index);
                    break;
                };

                debug_assert!(!downloaded.contains(&index));
                let newly_in_flight = in_flight_pieces.insert(index);
                debug_assert!(newly_in_flight, "piece {index} dispatched twice");

                let fetcher = Arc::clone(&self.fetcher);
                let piece_descriptor = Arc::clone(&descriptor);
                in_flight.spawn(async move {
                    let result =
                        fetch_verified_piece(fetcher.as_ref(), peer, &piece_descriptor, index)
                            .await;
                    (index, peer, result)
                });
            }

            if downloaded.len() as u32 == total {
                break None;
            }

            // Nothing left to wait on while pieces are still missing.
            if in_flight.is_empty() && backoff.is_empty() {
                let index = stalled
                    .or_else(|| (0..total).map(PieceIndex::new).find(|i| !downloaded.contains(i)))
                    .unwrap_or_default();
                break Some(DownloadError::IncompleteTransfer {
                    filename: filename.clone(),
                    index,
                    attempts: recovery.failed_rounds(index),
                });
            }
            if let Some(index) = stalled {
                picker.requeue(index);
            }

            tokio::select! {
                biased;

                _ = cancelled(&mut cancel) => {
                    break Some(DownloadError::Cancelled { filename: filename.clone() });
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    let (index, peer, result) = match joined {
                        Ok(outcome) => outcome,
                        Err(e) => break Some(aborted(&filename, &e)),
                    };
                    in_flight_pieces.remove(&index);

                    match result {
                        Ok(data) => {
                            if let Err(e) = assembler.write_piece(index, &data).await {
                                break Some(e);
                            }
                            recovery.record_success(index);
                            downloaded.insert(index);
                            served_by.insert(peer);
                            observer.on_progress(downloaded.len() as u32, total);
                        }
                        Err(error) => {
                            let category = ErrorCategory::from_transfer_error(&error);
                            match recovery.record_failure(index, peer, &job.candidates) {
                                RetryDecision::TryAnotherPeer => {
                                    tracing::debug!(
                                        file = %filename,
                                        piece = %index,
                                        peer = %peer,
                                        ?category,
                                        error = %error,
                                        "Piece failed, trying another peer"
                                    );
                                    picker.requeue(index);
                                }
                                RetryDecision::Backoff { round, delay } => {
                                    tracing::debug!(
                                        file = %filename,
                                        piece = %index,
                                        round,
                                        ?delay,
                                        ?category,
                                        error = %error,
                                        "Piece failed on every candidate, backing off"
                                    );
                                    backoff.spawn(async move {
                                        tokio::time::sleep(delay).await;
                                        index
                                    });
                                }
                                RetryDecision::GiveUp { rounds } => {
                                    tracing::warn!(
                                        file = %filename,
                                        piece = %index,
                                        rounds,
                                        error = %error,
                                        "Piece retries exhausted"
                                    );
                                    break Some(DownloadError::IncompleteTransfer {
                                        filename: filename.clone(),
                                        index,
                                        attempts: rounds,
                                    });
                                }
                            }
                        }
                    }
                }

                Some(joined) = backoff.join_next(), if !backoff.is_empty() => {
                    match joined {
                        Ok(index) => picker.requeue(index),
                        Err(e) => break Some(aborted(&filename, &e)),
                    }
                }
            }
        };

        in_flight.abort_all();
        backoff.abort_all();

        if let Some(error) = failure {
            assembler.discard().await;
            tracing::warn!(job = %job.id, file = %filename, error = %error, "Download failed");
            return Err(error);
        }

        let destination = assembler.finish().await?;
        let report = DownloadReport {
            job_id: job.id,
            filename,
            destination,
            bytes: descriptor.total_size,
            pieces: total,
            served_by,
            elapsed: started.elapsed(),
        };

        tracing::info!(
            job = %report.job_id,
            file = %report.filename,
            bytes = report.bytes,
            peers = report.served_by.len(),
            elapsed = ?report.elapsed,
            "Download completed"
        );
        Ok(report)
    }
}

/// Round-robin over candidates holding `index` that have not failed it
/// in the current round.
fn select_peer(
    candidates: &[Candidate],
    index: PieceIndex,
    recovery: &RecoveryTracker,
    cursor: &mut usize,
) -> Option<SocketAddr> {
    let count = candidates.len();
    (0..count)
        .map(|offset| (*cursor + offset) % count)
        .find(|&position| {
            let candidate = &candidates[position];
            candidate.has_piece(index) && !recovery.has_failed(index, candidate.address)
        })
        .map(|position| {
            *cursor = (position + 1) % count;
            candidates[position].address
        })
}

/// Resolves once cancellation is requested; never resolves if the
/// sender is gone without cancelling.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn aborted(filename: &str, error: &JoinError) -> DownloadError {
    DownloadError::Aborted {
        filename: filename.to_string(),
        reason: error.to_string(),
    }
}
