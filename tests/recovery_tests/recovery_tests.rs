//! Tests for crash recovery
//!
//! These tests verify:
//! - Data and deletions survive reopening
//! - Sequence numbers continue after reopening
//! - A dirty shutdown repairs torn data and tombstone tails
//! - Leftover and orphaned files are cleaned up
//! - Tombstones that no longer shadow anything are dropped
//! - Merged tombstone files respect the tombstone file size limit
//! - Reopening twice yields the same state

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::path::Path;
use std::time::Duration;

use driftkv::directory::{DbDirectory, DbMetadata};
use driftkv::segment::{segment_path, FileKind};
use driftkv::{Config, DriftError, Engine};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// Compaction kept out of the way so file sets are stable across reopens
fn test_config(dir: &Path) -> Config {
    Config::builder()
        .data_dir(dir)
        .max_file_size(16 * 1024)
        .compaction_threshold(1.0)
        .compaction_poll_interval(Duration::from_millis(10))
        .indexing_threads(3)
        .build()
}

fn open(dir: &Path) -> Engine {
    Engine::open(test_config(dir)).unwrap()
}

/// Leave the superblock as a crashed process would
fn mark_dirty(dir: &Path) {
    let mut metadata = DbMetadata::load(dir).unwrap();
    metadata.set_open(true);
    metadata.save().unwrap();
}

fn truncate_by(path: &Path, bytes: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len - bytes).unwrap();
}

fn file_names(dir: &Path) -> BTreeSet<String> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

fn key(i: usize) -> Vec<u8> {
    format!("key-{:04}", i).into_bytes()
}

fn value(i: usize) -> Vec<u8> {
    format!("value-{}", i).into_bytes()
}

// =============================================================================
// Clean Reopen
// =============================================================================

#[test]
fn test_reopen_restores_data() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(temp.path());
        for i in 0..1000 {
            engine.put(&key(i), &value(i)).unwrap();
        }
        engine.put(&key(7), b"overwritten").unwrap();
        engine.close().unwrap();
    }

    let engine = open(temp.path());
    assert!(!engine.recovery_result().repaired);
    assert!(engine.recovery_result().index_entries >= 1001);
    assert_eq!(engine.stats().live_keys, 1000);
    assert_eq!(engine.get(&key(7)).unwrap().value, Some(b"overwritten".to_vec()));
    for i in (0..1000).filter(|&i| i != 7) {
        assert_eq!(engine.get(&key(i)).unwrap().value, Some(value(i)));
    }
}

#[test]
fn test_reopen_without_close() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(temp.path());
        engine.put(b"k", b"v").unwrap();
        // Dropped without an explicit close
    }
    let engine = open(temp.path());
    assert_eq!(engine.get(b"k").unwrap().value, Some(b"v".to_vec()));
}

#[test]
fn test_deletes_survive_reopens() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(temp.path());
        engine.put(b"gone", b"v").unwrap();
        engine.put(b"kept", b"v").unwrap();
        engine.delete(b"gone").unwrap();
        engine.close().unwrap();
    }

    for _ in 0..2 {
        let engine = open(temp.path());
        assert!(!engine.get(b"gone").unwrap().is_found());
        assert!(engine.get(b"kept").unwrap().is_found());
        assert_eq!(engine.recovery_result().tombstones_kept, 1);
        engine.close().unwrap();
    }
}

#[test]
fn test_sequence_numbers_continue() {
    let temp = TempDir::new().unwrap();
    let before = {
        let engine = open(temp.path());
        engine.put(b"a", b"1").unwrap();
        let seq = engine.delete(b"a").unwrap().sequence_number.unwrap();
        engine.close().unwrap();
        seq
    };

    let engine = open(temp.path());
    let after = engine.put(b"b", b"2").unwrap().sequence_number.unwrap();
    assert!(after > before, "{} should follow {}", after, before);
}

#[test]
fn test_recovery_is_idempotent() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(temp.path());
        for i in 0..500 {
            engine.put(&key(i), &value(i)).unwrap();
        }
        for i in (0..500).step_by(3) {
            engine.delete(&key(i)).unwrap();
        }
        for i in (0..500).step_by(5) {
            engine.put(&key(i), b"again").unwrap();
        }
        engine.close().unwrap();
    }

    let snapshot = |engine: &Engine| -> Vec<Option<Vec<u8>>> {
        (0..500).map(|i| engine.get(&key(i)).unwrap().value).collect()
    };

    let first = open(temp.path());
    let first_values = snapshot(&first);
    first.close().unwrap();
    let first_files = file_names(temp.path());

    let second = open(temp.path());
    assert_eq!(snapshot(&second), first_values);
    assert_eq!(second.recovery_result().tombstones_dropped, 0);
    second.close().unwrap();
    assert_eq!(file_names(temp.path()), first_files);
}

// =============================================================================
// Tombstone Retention
// =============================================================================

#[test]
fn test_superseded_tombstone_dropped() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(temp.path());
        engine.put(b"k", b"v1").unwrap();
        engine.delete(b"k").unwrap();
        engine.put(b"k", b"v2").unwrap();
        engine.delete(b"other").unwrap();
        engine.close().unwrap();
    }
    let tombstones_before = DbDirectory::scan(temp.path()).unwrap().tombstone_files().to_vec();

    let engine = open(temp.path());
    let result = engine.recovery_result().clone();
    assert_eq!(result.tombstones_dropped, 1);
    assert_eq!(result.tombstones_kept, 0);
    assert_eq!(engine.get(b"k").unwrap().value, Some(b"v2".to_vec()));
    engine.close().unwrap();

    // Rewritten into fresh files
    let tombstones_after = DbDirectory::scan(temp.path()).unwrap().tombstone_files().to_vec();
    assert!(tombstones_after.iter().all(|id| !tombstones_before.contains(id)));
}

#[test]
fn test_tombstone_merge_rolls_over_at_size_limit() {
    let temp = TempDir::new().unwrap();
    // Four 22-byte tombstones per file
    let config = Config::builder()
        .data_dir(temp.path())
        .max_file_size(16 * 1024)
        .max_key_size(16)
        .max_tombstone_file_size(100)
        .compaction_threshold(1.0)
        .compaction_poll_interval(Duration::from_millis(10))
        .build();
    {
        let engine = Engine::open(config.clone()).unwrap();
        for i in 0..30 {
            engine.put(&key(i), &value(i)).unwrap();
        }
        for i in 0..20 {
            engine.delete(&key(i)).unwrap();
        }
        // Superseded, so the next open drops it and merges the rest
        engine.delete(&key(25)).unwrap();
        engine.put(&key(25), b"back").unwrap();
        engine.close().unwrap();
    }

    let engine = Engine::open(config.clone()).unwrap();
    let result = engine.recovery_result().clone();
    assert_eq!(result.tombstones_dropped, 1);
    assert_eq!(result.tombstones_kept, 20);
    engine.close().unwrap();

    let merged = DbDirectory::scan(temp.path()).unwrap().tombstone_files().to_vec();
    assert_eq!(merged.len(), 5);
    for &id in &merged {
        let size = fs::metadata(segment_path(temp.path(), id, FileKind::Tombstone)).unwrap().len();
        assert!(size <= 100, "tombstone file {} is {} bytes", id, size);
    }

    let engine = Engine::open(config).unwrap();
    assert_eq!(engine.recovery_result().tombstones_kept, 20);
    assert_eq!(engine.recovery_result().tombstones_dropped, 0);
    for i in 0..20 {
        assert!(!engine.get(&key(i)).unwrap().is_found());
    }
    for i in 20..30 {
        let expected = if i == 25 { b"back".to_vec() } else { value(i) };
        assert_eq!(engine.get(&key(i)).unwrap().value, Some(expected));
    }
}

// =============================================================================
// Dirty Shutdown
// =============================================================================

#[test]
fn test_torn_data_tail_repaired() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(temp.path());
        for i in 0..10 {
            engine.put(&key(i), &value(i)).unwrap();
        }
        engine.close().unwrap();
    }
    mark_dirty(temp.path());

    let newest = DbDirectory::scan(temp.path()).unwrap().newest_data_files().0.unwrap();
    truncate_by(&segment_path(temp.path(), newest, FileKind::Data), 5);

    let engine = open(temp.path());
    assert!(engine.recovery_result().repaired);
    for i in 0..9 {
        assert_eq!(engine.get(&key(i)).unwrap().value, Some(value(i)));
    }
    assert!(!engine.get(&key(9)).unwrap().is_found());

    // The repaired segment accepts reads and the engine accepts writes
    engine.put(&key(9), b"rewritten").unwrap();
    engine.close().unwrap();

    let engine = open(temp.path());
    assert!(!engine.recovery_result().repaired);
    assert_eq!(engine.get(&key(9)).unwrap().value, Some(b"rewritten".to_vec()));
}

#[test]
fn test_torn_tombstone_tail_repaired() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(temp.path());
        engine.put(b"a", b"1").unwrap();
        engine.put(b"b", b"2").unwrap();
        engine.delete(b"a").unwrap();
        engine.delete(b"b").unwrap();
        engine.close().unwrap();
    }
    mark_dirty(temp.path());

    let tombstone = *DbDirectory::scan(temp.path()).unwrap().tombstone_files().last().unwrap();
    truncate_by(&segment_path(temp.path(), tombstone, FileKind::Tombstone), 3);

    let engine = open(temp.path());
    assert!(engine.recovery_result().repaired);
    assert!(!engine.get(b"a").unwrap().is_found());
    // The torn deletion never happened
    assert_eq!(engine.get(b"b").unwrap().value, Some(b"2".to_vec()));
}

#[test]
fn test_io_error_flag_triggers_repair() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(temp.path());
        engine.put(b"k", b"v").unwrap();
        engine.close().unwrap();
    }

    let mut metadata = DbMetadata::load(temp.path()).unwrap();
    metadata.set_io_error(true);
    metadata.save().unwrap();

    let engine = open(temp.path());
    assert!(engine.recovery_result().repaired);
    assert_eq!(engine.get(b"k").unwrap().value, Some(b"v".to_vec()));
    engine.close().unwrap();

    // Cleared once the database reopened successfully
    assert!(!DbMetadata::load(temp.path()).unwrap().io_error());
}

// =============================================================================
// Directory Hygiene
// =============================================================================

#[test]
fn test_leftover_files_removed() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(temp.path());
        engine.put(b"k", b"v").unwrap();
        engine.close().unwrap();
    }
    File::create(temp.path().join("1.data.repair")).unwrap();
    File::create(segment_path(temp.path(), 90, FileKind::Index)).unwrap();
    File::create(segment_path(temp.path(), 91, FileKind::Data)).unwrap();
    File::create(segment_path(temp.path(), 92, FileKind::CompactedTombstone)).unwrap();
    mark_dirty(temp.path());

    let engine = open(temp.path());
    assert_eq!(engine.get(b"k").unwrap().value, Some(b"v".to_vec()));

    let names = file_names(temp.path());
    for leftover in ["1.data.repair", "90.index", "91.data", "92.tombstonec"] {
        assert!(!names.contains(leftover), "{} still present", leftover);
    }

    // New files never reuse an id seen at open
    engine.delete(b"k").unwrap();
    let tombstones = DbDirectory::scan(temp.path()).unwrap().tombstone_files().to_vec();
    assert_eq!(tombstones.len(), 1);
    assert!(tombstones[0] > 92);
}

#[test]
fn test_data_file_without_index_is_structural() {
    let temp = TempDir::new().unwrap();
    {
        let engine = open(temp.path());
        engine.put(b"k", b"v").unwrap();
        engine.close().unwrap();
    }
    let listing = DbDirectory::scan(temp.path()).unwrap();
    let (id, _) = listing.data_files().next().unwrap();
    fs::remove_file(segment_path(temp.path(), id, FileKind::Index)).unwrap();

    assert!(matches!(
        Engine::open(test_config(temp.path())),
        Err(DriftError::Structural(_))
    ));
}

#[test]
fn test_max_file_size_is_frozen() {
    let temp = TempDir::new().unwrap();
    open(temp.path()).close().unwrap();

    let changed = Config::builder()
        .data_dir(temp.path())
        .max_file_size(32 * 1024)
        .build();
    assert!(matches!(Engine::open(changed), Err(DriftError::Config(_))));

    // The original size still opens
    open(temp.path()).close().unwrap();
}
