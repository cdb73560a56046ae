//! File-to-peer assignment via maximum bipartite matching.
//!
//! Requested files form the left side of the graph, distinct idle holders the
//! right side, with an edge wherever a peer holds a file. Hopcroft-Karp finds
//! a maximum matching, so two files are never routed to the same peer when
//! another peer could have served one of them.
//!
//! Files are visited in name order and each file's holders in [`PeerKey`]
//! order, which makes the result a pure function of its input.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use super::PeerKey;

/// Result of one matching computation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Assignment {
    /// Injective file to peer map.
    pub matched: BTreeMap<String, PeerKey>,
    /// Requested files left without a peer, in name order.
    pub unmatched: Vec<String>,
}

impl Assignment {
    /// True when every requested file received a peer.
    pub fn is_complete(&self) -> bool {
        self.unmatched.is_empty()
    }
}

/// Matches requested files to distinct holders.
///
/// `holders` maps every requested file to the idle peers that hold it; a
/// file with no holders maps to an empty set.
pub fn compute_assignment(holders: &BTreeMap<String, BTreeSet<PeerKey>>) -> Assignment {
    let files: Vec<&String> = holders.keys().collect();
    let peers: Vec<PeerKey> = holders
        .values()
        .flatten()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let adjacency: Vec<Vec<usize>> = holders
        .values()
        .map(|file_holders| {
            file_holders
                .iter()
                .filter_map(|peer| peers.binary_search(peer).ok())
                .collect()
        })
        .collect();

    let mut matcher = HopcroftKarp::new(adjacency, peers.len());
    matcher.run();

    let mut assignment = Assignment::default();
    for (file_index, file) in files.into_iter().enumerate() {
        match matcher.pair_left[file_index] {
            Some(peer_index) => {
                assignment
                    .matched
                    .insert(file.clone(), peers[peer_index]);
            }
            None => assignment.unmatched.push(file.clone()),
        }
    }
    assignment
}

const UNREACHED: usize = usize::MAX;

struct HopcroftKarp {
    adjacency: Vec<Vec<usize>>,
    pair_left: Vec<Option<usize>>,
    pair_right: Vec<Option<usize>>,
    layer: Vec<usize>,
}

impl HopcroftKarp {
    fn new(adjacency: Vec<Vec<usize>>, right_count: usize) -> Self {
        let left_count = adjacency.len();
        Self {
            adjacency,
            pair_left: vec![None; left_count],
            pair_right: vec![None; right_count],
            layer: vec![UNREACHED; left_count],
        }
    }

    fn run(&mut self) {
        while self.build_layers() {
            for left in 0..self.adjacency.len() {
                if self.pair_left[left].is_none() {
                    self.augment(left);
                }
            }
        }
    }

    /// Breadth-first layering from every free left vertex. Returns true when
    /// some free right vertex is reachable, i.e. an augmenting path exists.
    fn build_layers(&mut self) -> bool {
        let mut queue = VecDeque::new();
        for left in 0..self.adjacency.len() {
            if self.pair_left[left].is_none() {
                self.layer[left] = 0;
                queue.push_back(left);
            } else {
                self.layer[left] = UNREACHED;
            }
        }

        let mut found_free_right = false;
        while let Some(left) = queue.pop_front() {
            for &right in &self.adjacency[left] {
                match self.pair_right[right] {
                    None => found_free_right = true,
                    Some(next) if self.layer[next] == UNREACHED => {
                        self.layer[next] = self.layer[left] + 1;
                        queue.push_back(next);
                    }
                    Some(_) => {}
                }
            }
        }
        found_free_right
    }

    /// Depth-first search for an augmenting path along the layers.
    fn augment(&mut self, left: usize) -> bool {
        for edge in 0..self.adjacency[left].len() {
            let right = self.adjacency[left][edge];
            let extends = match self.pair_right[right] {
                None => true,
                Some(next) => self.layer[next] == self.layer[left] + 1 && self.augment(next),
            };
            if extends {
                self.pair_left[left] = Some(right);
                self.pair_right[right] = Some(left);
                return true;
            }
        }
        self.layer[left] = UNREACHED;
        false
    }
}
