//! On-heap index backend
//!
//! Hash map split into independently locked shards so recovery workers and
//! the compaction worker rarely contend.

use std::collections::hash_map::{Entry, RandomState};
use std::collections::HashMap;
use std::hash::BuildHasher;

use parking_lot::RwLock;

use super::{IndexMap, IndexMetadata};

const DEFAULT_SHARDS: usize = 16;

type Shard = RwLock<HashMap<Vec<u8>, IndexMetadata>>;

pub struct OnHeapIndex {
    shards: Vec<Shard>,
    hasher: RandomState,
}

impl OnHeapIndex {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// `count` is rounded up to a power of two
    pub fn with_shards(count: usize) -> Self {
        let count = count.max(1).next_power_of_two();
        Self {
            shards: (0..count).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        let hash = self.hasher.hash_one(key) as usize;
        &self.shards[hash & (self.shards.len() - 1)]
    }

    fn compare_and_swap(
        &self,
        key: &[u8],
        old: &IndexMetadata,
        new: IndexMetadata,
    ) -> bool {
        let mut shard = self.shard(key).write();
        match shard.get_mut(key) {
            Some(current) if current == old => {
                *current = new;
                true
            }
            _ => false,
        }
    }
}

impl Default for OnHeapIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexMap for OnHeapIndex {
    fn get(&self, key: &[u8]) -> Option<IndexMetadata> {
        self.shard(key).read().get(key).copied()
    }

    fn put(&self, key: &[u8], metadata: IndexMetadata) {
        self.shard(key).write().insert(key.to_vec(), metadata);
    }

    fn put_if_absent(&self, key: &[u8], metadata: IndexMetadata) -> Option<IndexMetadata> {
        let mut shard = self.shard(key).write();
        match shard.entry(key.to_vec()) {
            Entry::Occupied(existing) => Some(*existing.get()),
            Entry::Vacant(slot) => {
                slot.insert(metadata);
                None
            }
        }
    }

    fn replace(&self, key: &[u8], old: &IndexMetadata, new: IndexMetadata) -> bool {
        if new.sequence_number <= old.sequence_number {
            return false;
        }
        self.compare_and_swap(key, old, new)
    }

    fn relocate(&self, key: &[u8], old: &IndexMetadata, new: IndexMetadata) -> bool {
        if new.sequence_number != old.sequence_number {
            return false;
        }
        self.compare_and_swap(key, old, new)
    }

    fn delete(&self, key: &[u8]) -> Option<IndexMetadata> {
        self.shard(key).write().remove(key)
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    fn close(&self) {
        for shard in &self.shards {
            let mut shard = shard.write();
            shard.clear();
            shard.shrink_to_fit();
        }
    }
}
