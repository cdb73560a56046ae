//! Rarest-first piece ordering.
//!
//! Pieces offered by fewer candidates are fetched first. Ties keep index
//! order.

use std::collections::{BTreeSet, VecDeque};
use std::net::SocketAddr;

use crate::transfer::PieceIndex;

/// Which pieces a candidate peer offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    /// Holds the complete file.
    Whole,
    /// Holds only the listed pieces.
    Partial(BTreeSet<PieceIndex>),
}

/// Peer a job may fetch pieces from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub address: SocketAddr,
    pub availability: Availability,
}

impl Candidate {
    /// Candidate holding the whole file.
    pub fn whole(address: SocketAddr) -> Self {
        Self {
            address,
            availability: Availability::Whole,
        }
    }

    pub fn has_piece(&self, index: PieceIndex) -> bool {
        match &self.availability {
            Availability::Whole => true,
            Availability::Partial(pieces) => pieces.contains(&index),
        }
    }
}

/// Number of candidates offering each piece.
pub fn piece_availability(piece_count: u32, candidates: &[Candidate]) -> Vec<usize> {
    (0..piece_count)
        .map(|index| {
            candidates
                .iter()
                .filter(|candidate| candidate.has_piece(PieceIndex::new(index)))
                .count()
        })
        .collect()
}

/// Strategy choosing which pending piece to fetch next.
pub trait PiecePicker: Send {
    /// Takes the next piece to fetch.
    fn next_piece(&mut self) -> Option<PieceIndex>;

    /// Returns a piece to the pending set after a failed attempt.
    fn requeue(&mut self, index: PieceIndex);

    /// Pieces currently pending.
    fn remaining(&self) -> usize;
}

/// Picker ordering pending pieces by ascending availability.
#[derive(Debug, Clone)]
pub struct RarestFirstPicker {
    availability: Vec<usize>,
    pending: VecDeque<PieceIndex>,
}

impl RarestFirstPicker {
    pub fn new(piece_count: u32, candidates: &[Candidate]) -> Self {
        let availability = piece_availability(piece_count, candidates);

        let mut pending: Vec<PieceIndex> = (0..piece_count).map(PieceIndex::new).collect();
        pending.sort_by_key(|index| (availability[index.as_u32() as usize], *index));

        Self {
            availability,
            pending: pending.into(),
        }
    }

    /// Availability of a piece, zero when out of range.
    pub fn availability(&self, index: PieceIndex) -> usize {
        self.availability
            .get(index.as_u32() as usize)
            .copied()
            .unwrap_or(0)
    }

    /// First piece no candidate offers, if any.
    pub fn unavailable_piece(&self) -> Option<PieceIndex> {
        self.availability
            .iter()
            .position(|&count| count == 0)
            .map(|index| PieceIndex::new(index as u32))
    }

    fn sort_key(&self, index: PieceIndex) -> (usize, PieceIndex) {
        (self.availability(index), index)
    }
}

impl PiecePicker for RarestFirstPicker {
    fn next_piece(&mut self) -> Option<PieceIndex> {
        self.pending.pop_front()
    }

    fn requeue(&mut self, index: PieceIndex) {
        if self.pending.contains(&index) {
            return;
        }
        let key = self.sort_key(index);
        let position = self
            .pending
            .iter()
            .position(|pending| self.sort_key(*pending) > key)
            .unwrap_or(self.pending.len());
        self.pending.insert(position, index);
    }

    fn remaining(&self) -> usize {
        self.pending.len()
    }
}
