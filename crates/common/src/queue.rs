//! Priority order over missing chunks
//!
//! Each chunk carries a [`Weight`]; its scalar priority is
//!
//! ```text
//! clustered * [is clustered] + immediate * [is immediate]
//!     + rarity * (peer_count - owners) / peer_count
//! ```
//!
//! Chunks finishing partially-present files come first, chunks few peers hold
//! next. Equal priorities are broken by ascending chunk hash so the order is
//! fully deterministic.

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::content::ChunkHash;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightConstants {
    pub clustered: f64,
    pub immediate: f64,
    pub rarity: f64,
}

impl Default for WeightConstants {
    fn default() -> Self {
        Self {
            clustered: 10.0,
            immediate: 20.0,
            rarity: 25.0,
        }
    }
}

/// Inputs to a chunk's priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Weight {
    /// Part of a file some of whose chunks are already present
    pub clustered: bool,
    /// Explicitly wanted as soon as possible
    pub immediate: bool,
    /// Connected peers owning the chunk
    pub owners: u32,
    /// Connected peers overall
    pub peer_count: u32,
}

impl Weight {
    pub fn priority(&self, constants: &WeightConstants) -> f64 {
        let mut priority = 0.0;
        if self.clustered {
            priority += constants.clustered;
        }
        if self.immediate {
            priority += constants.immediate;
        }
        if self.peer_count > 0 {
            let missing = self.peer_count.saturating_sub(self.owners) as f64;
            priority += constants.rarity * missing / self.peer_count as f64;
        }
        priority
    }
}

/// Total order over f64 priorities
#[derive(Debug, Clone, Copy)]
struct Priority(f64);

impl PartialEq for Priority {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

type Key = (Reverse<Priority>, ChunkHash);

#[derive(Debug, Clone, Default)]
pub struct WeightedQueue {
    constants: WeightConstants,
    peer_count: u32,
    weights: HashMap<ChunkHash, Weight>,
    ordered: BTreeSet<Key>,
}

impl WeightedQueue {
    pub fn new(constants: WeightConstants) -> Self {
        Self {
            constants,
            ..Default::default()
        }
    }

    fn key(&self, id: ChunkHash, weight: &Weight) -> Key {
        (Reverse(Priority(weight.priority(&self.constants))), id)
    }

    /// Start tracking `id` with no owners. No-op if already tracked.
    pub fn add(&mut self, id: ChunkHash) -> bool {
        if self.weights.contains_key(&id) {
            return false;
        }
        let weight = Weight {
            peer_count: self.peer_count,
            ..Default::default()
        };
        self.ordered.insert(self.key(id, &weight));
        self.weights.insert(id, weight);
        true
    }

    pub fn remove(&mut self, id: &ChunkHash) -> bool {
        match self.weights.remove(id) {
            Some(weight) => {
                let key = self.key(*id, &weight);
                self.ordered.remove(&key);
                true
            }
            None => false,
        }
    }

    fn update(&mut self, id: &ChunkHash, f: impl FnOnce(&mut Weight)) -> bool {
        let Some(mut weight) = self.weights.get(id).copied() else {
            return false;
        };
        let old = self.key(*id, &weight);
        f(&mut weight);
        self.ordered.remove(&old);
        self.ordered.insert(self.key(*id, &weight));
        self.weights.insert(*id, weight);
        true
    }

    /// Number of connected peers; reweights every chunk
    pub fn set_global_peer_count(&mut self, peer_count: u32) {
        if peer_count == self.peer_count {
            return;
        }
        self.peer_count = peer_count;
        let ids: Vec<ChunkHash> = self.weights.keys().copied().collect();
        for id in ids {
            self.update(&id, |w| w.peer_count = peer_count);
        }
    }

    pub fn set_chunk_owner_count(&mut self, id: &ChunkHash, owners: u32) -> bool {
        self.update(id, |w| w.owners = owners)
    }

    pub fn mark_clustered(&mut self, id: &ChunkHash) -> bool {
        self.update(id, |w| w.clustered = true)
    }

    pub fn unmark_clustered(&mut self, id: &ChunkHash) -> bool {
        self.update(id, |w| w.clustered = false)
    }

    pub fn mark_immediate(&mut self, id: &ChunkHash) -> bool {
        self.update(id, |w| w.immediate = true)
    }

    /// Highest priority first
    pub fn iter(&self) -> impl Iterator<Item = ChunkHash> + '_ {
        self.ordered.iter().map(|(_, id)| *id)
    }

    pub fn ordered_ids(&self) -> Vec<ChunkHash> {
        self.iter().collect()
    }

    pub fn weight(&self, id: &ChunkHash) -> Option<Weight> {
        self.weights.get(id).copied()
    }

    pub fn priority(&self, id: &ChunkHash) -> Option<f64> {
        self.weights.get(id).map(|w| w.priority(&self.constants))
    }

    pub fn contains(&self, id: &ChunkHash) -> bool {
        self.weights.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.weights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.weights.is_empty()
    }
}
