//! Retry bookkeeping for failed piece fetches.
//!
//! A failed piece first moves on to a candidate that has not failed it yet.
//! Once every candidate has failed, the piece's failure counter goes up, the
//! tried set resets and the piece waits out a backoff delay before the next
//! round. A counter above `max_retries` ends the job.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;

use super::Candidate;
use crate::config::TransferConfig;
use crate::transfer::{PieceIndex, TransferError};

/// Delay policy between retry rounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Doubling delay from `base_delay`, capped at `max_delay`, with jitter.
    ExponentialBackoff {
        base_delay: Duration,
        max_delay: Duration,
    },
    FixedDelay {
        delay: Duration,
    },
    Immediate,
}

impl RetryStrategy {
    /// Delay before retry round `round` (1-based).
    pub fn calculate_delay(&self, round: u32) -> Duration {
        match self {
            Self::ExponentialBackoff {
                base_delay,
                max_delay,
            } => {
                let factor = 2u32.saturating_pow(round.saturating_sub(1));
                let capped = base_delay.saturating_mul(factor).min(*max_delay);
                // Up to 25% jitter.
                let jitter_range = capped.as_millis() as u64 / 4;
                let jitter = if jitter_range > 0 {
                    rand::rng().random_range(0..=jitter_range)
                } else {
                    0
                };
                capped.saturating_sub(Duration::from_millis(jitter))
            }
            Self::FixedDelay { delay } => *delay,
            Self::Immediate => Duration::ZERO,
        }
    }
}

/// Broad class of a fetch failure, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection refused, reset or truncated
    Network,
    Timeout,
    /// Hash or length mismatch
    Verification,
    /// Peer does not serve the file or index
    Unavailable,
    Protocol,
}

impl ErrorCategory {
    pub fn from_transfer_error(error: &TransferError) -> Self {
        match error {
            TransferError::PieceTransfer { .. } | TransferError::Io(_) => Self::Network,
            TransferError::Timeout { .. } => Self::Timeout,
            TransferError::PieceIntegrity { .. } => Self::Verification,
            TransferError::FileNotFound { .. } | TransferError::InvalidPieceIndex { .. } => {
                Self::Unavailable
            }
            TransferError::Protocol { .. }
            | TransferError::InvalidDescriptor { .. }
            | TransferError::Json(_) => Self::Protocol,
        }
    }
}

/// Retry limits for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failed rounds tolerated per piece before the job fails.
    pub max_retries: u32,
    pub strategy: RetryStrategy,
}

impl RetryPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            strategy: RetryStrategy::ExponentialBackoff {
                base_delay: config.retry_base_delay,
                max_delay: config.retry_max_delay,
            },
        }
    }
}

/// What to do with a piece after a failed fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// An untried candidate remains; requeue right away.
    TryAnotherPeer,
    /// Every candidate failed this round; requeue after the delay.
    Backoff { round: u32, delay: Duration },
    /// Budget exhausted.
    GiveUp { rounds: u32 },
}

#[derive(Debug, Default, Clone)]
struct PieceAttempts {
    tried: BTreeSet<SocketAddr>,
    failed_rounds: u32,
}

/// Per-piece retry state for one job.
#[derive(Debug)]
pub struct RecoveryTracker {
    policy: RetryPolicy,
    pieces: HashMap<PieceIndex, PieceAttempts>,
}

impl RecoveryTracker {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            pieces: HashMap::new(),
        }
    }

    /// True when `peer` already failed `index` in the current round.
    pub fn has_failed(&self, index: PieceIndex, peer: SocketAddr) -> bool {
        self.pieces
            .get(&index)
            .is_some_and(|attempts| attempts.tried.contains(&peer))
    }

    pub fn failed_rounds(&self, index: PieceIndex) -> u32 {
        self.pieces
            .get(&index)
            .map_or(0, |attempts| attempts.failed_rounds)
    }

    /// Records a failed fetch of `index` from `peer` and decides what follows.
    pub fn record_failure(
        &mut self,
        index: PieceIndex,
        peer: SocketAddr,
        candidates: &[Candidate],
    ) -> RetryDecision {
        let attempts = self.pieces.entry(index).or_default();
        attempts.tried.insert(peer);

        let untried_remains = candidates.iter().any(|candidate| {
            candidate.has_piece(index) && !attempts.tried.contains(&candidate.address)
        });
        if untried_remains {
            return RetryDecision::TryAnotherPeer;
        }

        attempts.failed_rounds += 1;
        attempts.tried.clear();

        if attempts.failed_rounds > self.policy.max_retries {
            return RetryDecision::GiveUp {
                rounds: attempts.failed_rounds,
            };
        }

        RetryDecision::Backoff {
            round: attempts.failed_rounds,
            delay: self.policy.strategy.calculate_delay(attempts.failed_rounds),
        }
    }

    /// Forgets a piece once it has been downloaded.
    pub fn record_success(&mut self, index: PieceIndex) {
        self.pieces.remove(&index);
    }
}
