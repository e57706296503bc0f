//! Index Module
//!
//! The authoritative key → location table.
//!
//! ## Responsibilities
//! - One [`IndexMetadata`] per live key, nothing for deleted keys
//! - Atomic compare-and-swap updates so the parallel recovery rebuild and the
//!   compaction worker never lose a concurrent update
//! - `replace` refuses to install an entry whose sequence number does not
//!   strictly increase; `relocate` is the only way to move an entry without
//!   bumping it
//!
//! Backends implement [`IndexMap`]; the engine only talks to the trait.

mod on_heap;

pub use on_heap::OnHeapIndex;

/// Where the live value of a key lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexMetadata {
    pub file_id: u32,
    pub value_offset: u32,
    pub value_size: u32,
    pub sequence_number: i64,
}

impl IndexMetadata {
    pub fn new(file_id: u32, value_offset: u32, value_size: u32, sequence_number: i64) -> Self {
        Self {
            file_id,
            value_offset,
            value_size,
            sequence_number,
        }
    }

    /// Full on-disk size of the record this entry points at
    pub fn record_size(&self, key_len: usize) -> u32 {
        crate::codec::Record::size_of(key_len, self.value_size as usize) as u32
    }
}

/// Contract every index backend satisfies.
///
/// All operations are linearizable per key.
pub trait IndexMap: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<IndexMetadata>;

    /// Unconditionally install `metadata`
    fn put(&self, key: &[u8], metadata: IndexMetadata);

    /// Install `metadata` unless the key is present; returns the present entry
    fn put_if_absent(&self, key: &[u8], metadata: IndexMetadata) -> Option<IndexMetadata>;

    /// Swap `old` for `new` iff the current entry equals `old` and
    /// `new.sequence_number > old.sequence_number`
    fn replace(&self, key: &[u8], old: &IndexMetadata, new: IndexMetadata) -> bool;

    /// Move the key to a new location without changing its version: swap
    /// `old` for `new` iff the current entry equals `old` and both carry the
    /// same sequence number. Used when compaction relocates a live record.
    fn relocate(&self, key: &[u8], old: &IndexMetadata, new: IndexMetadata) -> bool;

    /// Remove the key, returning what was removed
    fn delete(&self, key: &[u8]) -> Option<IndexMetadata>;

    /// Number of live keys
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release backend resources
    fn close(&self);
}
