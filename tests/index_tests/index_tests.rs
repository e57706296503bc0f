//! Tests for the in-memory index
//!
//! These tests verify:
//! - Basic get/put/delete bookkeeping
//! - put_if_absent reports the present entry
//! - replace only installs strictly newer versions
//! - relocate only moves an entry without changing its version
//! - Compare-and-swap under concurrent updates

use std::sync::Arc;
use std::thread;

use driftkv::index::{IndexMap, IndexMetadata, OnHeapIndex};

// =============================================================================
// Helper Functions
// =============================================================================

fn meta(file_id: u32, sequence_number: i64) -> IndexMetadata {
    IndexMetadata::new(file_id, 100, 10, sequence_number)
}

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_put_get_delete() {
    let index = OnHeapIndex::new();
    assert!(index.is_empty());
    assert_eq!(index.get(b"a"), None);

    index.put(b"a", meta(1, 1));
    index.put(b"b", meta(1, 2));
    assert_eq!(index.len(), 2);
    assert_eq!(index.get(b"a"), Some(meta(1, 1)));

    assert_eq!(index.delete(b"a"), Some(meta(1, 1)));
    assert_eq!(index.delete(b"a"), None);
    assert_eq!(index.len(), 1);
}

#[test]
fn test_put_if_absent() {
    let index = OnHeapIndex::new();
    assert_eq!(index.put_if_absent(b"k", meta(1, 1)), None);
    assert_eq!(index.put_if_absent(b"k", meta(2, 2)), Some(meta(1, 1)));
    assert_eq!(index.get(b"k"), Some(meta(1, 1)));
}

#[test]
fn test_close_clears_entries() {
    let index = OnHeapIndex::with_shards(3);
    for i in 0..100u32 {
        index.put(&i.to_be_bytes(), meta(i, i as i64));
    }
    assert_eq!(index.len(), 100);
    index.close();
    assert!(index.is_empty());
}

// =============================================================================
// Conditional Updates
// =============================================================================

#[test]
fn test_replace_requires_newer_sequence() {
    let index = OnHeapIndex::new();
    index.put(b"k", meta(1, 5));

    assert!(!index.replace(b"k", &meta(1, 5), meta(2, 5)));
    assert!(!index.replace(b"k", &meta(1, 5), meta(2, 4)));
    assert!(index.replace(b"k", &meta(1, 5), meta(2, 6)));
    assert_eq!(index.get(b"k"), Some(meta(2, 6)));
}

#[test]
fn test_replace_requires_current_entry() {
    let index = OnHeapIndex::new();
    index.put(b"k", meta(1, 5));

    assert!(!index.replace(b"k", &meta(3, 5), meta(4, 9)));
    assert!(!index.replace(b"missing", &meta(1, 5), meta(4, 9)));
    assert_eq!(index.get(b"k"), Some(meta(1, 5)));
}

#[test]
fn test_relocate_keeps_sequence() {
    let index = OnHeapIndex::new();
    index.put(b"k", meta(1, 5));

    assert!(!index.relocate(b"k", &meta(1, 5), meta(2, 6)));
    assert!(index.relocate(b"k", &meta(1, 5), meta(2, 5)));
    assert_eq!(index.get(b"k"), Some(meta(2, 5)));

    // Overwritten since the compactor read it
    assert!(!index.relocate(b"k", &meta(1, 5), meta(3, 5)));
}

// =============================================================================
// Concurrency
// =============================================================================

#[test]
fn test_concurrent_replace_keeps_highest_sequence() {
    let index = Arc::new(OnHeapIndex::new());
    index.put(b"k", meta(0, 0));

    let handles: Vec<_> = (1..=8)
        .map(|t| {
            let index = Arc::clone(&index);
            thread::spawn(move || {
                for i in 0..1000i64 {
                    let candidate = meta(t, i * 8 + t as i64);
                    loop {
                        let current = index.get(b"k").unwrap();
                        if candidate.sequence_number <= current.sequence_number
                            || index.replace(b"k", &current, candidate)
                        {
                            break;
                        }
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(index.get(b"k").unwrap().sequence_number, 999 * 8 + 8);
}

#[test]
fn test_concurrent_put_if_absent_single_winner() {
    let index = Arc::new(OnHeapIndex::new());

    let winners: usize = (0..8u32)
        .map(|t| {
            let index = Arc::clone(&index);
            thread::spawn(move || index.put_if_absent(b"race", meta(t, t as i64)).is_none())
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap() as usize)
        .sum();

    assert_eq!(winners, 1);
    assert_eq!(index.len(), 1);
}
