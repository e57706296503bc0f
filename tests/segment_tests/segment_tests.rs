//! Tests for the segment store
//!
//! These tests verify:
//! - Exclusive creation of data, index and tombstone files
//! - Append/read through the data file and its side-car index
//! - Iteration stops at a torn tail and reports where
//! - Tail repair keeps exactly the valid prefix
//! - Byte-for-byte relocation between segments

use std::fs::{self, OpenOptions};
use std::path::Path;

use driftkv::codec::{Entry, Record, TombstoneFileEntry};
use driftkv::segment::{segment_path, DataFile, FileKind, TombstoneFile};
use driftkv::DriftError;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const FLUSH_THRESHOLD: u64 = 1024 * 1024;

fn data_file(dir: &Path, id: u32) -> DataFile {
    DataFile::create(dir, id, false, FLUSH_THRESHOLD).unwrap()
}

fn truncate_by(path: &Path, bytes: u64) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    let len = file.metadata().unwrap().len();
    file.set_len(len - bytes).unwrap();
}

fn write_records(file: &DataFile, count: usize) -> Vec<Record> {
    (0..count)
        .map(|i| {
            let record = Record::new(
                format!("key-{}", i).into_bytes(),
                format!("value-{}", i).into_bytes(),
                i as i64 + 1,
            );
            file.write_record(&record).unwrap();
            record
        })
        .collect()
}

// =============================================================================
// Data File Tests
// =============================================================================

#[test]
fn test_create_makes_data_and_index_files() {
    let temp = TempDir::new().unwrap();
    let file = data_file(temp.path(), 1);

    assert!(segment_path(temp.path(), 1, FileKind::Data).exists());
    assert!(segment_path(temp.path(), 1, FileKind::Index).exists());
    assert_eq!(file.write_offset(), 0);
    assert!(!file.is_sealed());
}

#[test]
fn test_create_fails_on_id_collision() {
    let temp = TempDir::new().unwrap();
    let _first = data_file(temp.path(), 1);

    let err = DataFile::create(temp.path(), 1, false, FLUSH_THRESHOLD).err().unwrap();
    assert!(matches!(err, DriftError::Io(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists));
}

#[test]
fn test_write_then_read_value() {
    let temp = TempDir::new().unwrap();
    let file = data_file(temp.path(), 1);

    let record = Record::new(b"hello".to_vec(), b"world".to_vec(), 5);
    let location = file.write_record(&record).unwrap();

    assert_eq!(location.file_id, 1);
    assert_eq!(location.value_offset, (Record::HEADER_SIZE + 5) as u32);
    assert_eq!(location.value_size, 5);
    assert_eq!(location.sequence_number, 5);
    assert_eq!(file.write_offset() as usize, record.serialized_size());

    assert_eq!(file.read_value(b"hello", &location).unwrap(), b"world".to_vec());
    assert_eq!(file.read(location.value_offset, location.value_size).unwrap(), b"world".to_vec());
}

#[test]
fn test_read_detects_corruption() {
    let temp = TempDir::new().unwrap();
    let file = data_file(temp.path(), 1);
    let location = file
        .write_record(&Record::new(b"k".to_vec(), b"value".to_vec(), 1))
        .unwrap();
    file.flush_to_disk().unwrap();

    // Overwrite the last value byte in place
    let path = segment_path(temp.path(), 1, FileKind::Data);
    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let reopened = DataFile::open(temp.path(), 1, false, FLUSH_THRESHOLD).unwrap();
    let err = reopened.read_value(b"k", &location).unwrap_err();
    assert!(matches!(err, DriftError::Checksum { .. }));
}

#[test]
fn test_index_file_mirrors_records() {
    let temp = TempDir::new().unwrap();
    let file = data_file(temp.path(), 1);
    let records = write_records(&file, 10);

    let entries: Vec<_> = file.index_file().iter().unwrap().map(|(_, e)| e).collect();
    assert_eq!(entries.len(), records.len());

    let mut offset = 0u32;
    for (entry, record) in entries.iter().zip(&records) {
        assert_eq!(entry.key, record.key);
        assert_eq!(entry.record_offset, offset);
        assert_eq!(entry.record_size as usize, record.serialized_size());
        assert_eq!(entry.sequence_number, record.sequence_number);
        offset += entry.record_size;
    }
}

#[test]
fn test_open_restores_write_offset() {
    let temp = TempDir::new().unwrap();
    let size = {
        let file = data_file(temp.path(), 3);
        write_records(&file, 4);
        file.seal().unwrap();
        file.write_offset()
    };

    let reopened = DataFile::open(temp.path(), 3, false, FLUSH_THRESHOLD).unwrap();
    assert_eq!(reopened.write_offset(), size);
    assert!(reopened.is_sealed());
    assert_eq!(reopened.iter().unwrap().count(), 4);
}

#[test]
fn test_iterator_stops_at_torn_tail() {
    let temp = TempDir::new().unwrap();
    {
        let file = data_file(temp.path(), 1);
        write_records(&file, 5);
        file.flush_to_disk().unwrap();
    }
    truncate_by(&segment_path(temp.path(), 1, FileKind::Data), 5);

    let file = DataFile::open(temp.path(), 1, false, FLUSH_THRESHOLD).unwrap();
    let mut iter = file.iter().unwrap();
    let keys: Vec<_> = iter.by_ref().map(|(_, r)| r.key).collect();

    assert_eq!(keys.len(), 4);
    assert_eq!(keys[3], b"key-3".to_vec());
    assert_eq!(iter.corruption(), Some(iter.valid_len()));
}

#[test]
fn test_iterator_rejects_oversized_length_field() {
    let temp = TempDir::new().unwrap();
    let last_offset = {
        let file = data_file(temp.path(), 1);
        let records = write_records(&file, 5);
        file.flush_to_disk().unwrap();
        records[..4].iter().map(|r| r.serialized_size() as u64).sum::<u64>()
    };

    // value_size of the last record claims ~4 GiB
    let path = segment_path(temp.path(), 1, FileKind::Data);
    let mut bytes = fs::read(&path).unwrap();
    let at = last_offset as usize + 2;
    bytes[at..at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
    fs::write(&path, &bytes).unwrap();

    let file = DataFile::open(temp.path(), 1, false, FLUSH_THRESHOLD).unwrap();
    let mut iter = file.iter().unwrap();
    assert_eq!(iter.by_ref().count(), 4);
    assert_eq!(iter.corruption(), Some(last_offset));

    let repaired = file.repair(FLUSH_THRESHOLD).unwrap();
    assert_eq!(repaired.write_offset() as u64, last_offset);
}

#[test]
fn test_repair_keeps_valid_prefix() {
    let temp = TempDir::new().unwrap();
    let records = {
        let file = data_file(temp.path(), 1);
        let records = write_records(&file, 5);
        file.flush_to_disk().unwrap();
        records
    };
    truncate_by(&segment_path(temp.path(), 1, FileKind::Data), 5);

    let file = DataFile::open(temp.path(), 1, false, FLUSH_THRESHOLD).unwrap();
    let repaired = file.repair(FLUSH_THRESHOLD).unwrap();

    let valid: u32 = records[..4].iter().map(|r| r.serialized_size() as u32).sum();
    assert_eq!(repaired.write_offset(), valid);
    assert_eq!(repaired.index_file().iter().unwrap().count(), 4);

    let mut iter = repaired.iter().unwrap();
    assert_eq!(iter.by_ref().count(), 4);
    assert_eq!(iter.corruption(), None);

    let leftovers: Vec<_> = fs::read_dir(temp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().ends_with(".repair"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn test_relocate_copies_record_bytes() {
    let temp = TempDir::new().unwrap();
    let source = data_file(temp.path(), 1);
    write_records(&source, 3);
    source.seal().unwrap();

    let target = DataFile::create(temp.path(), 2, true, FLUSH_THRESHOLD).unwrap();
    assert!(segment_path(temp.path(), 2, FileKind::CompactedData).exists());

    let entry = source.index_file().iter().unwrap().nth(1).map(|(_, e)| e).unwrap();
    let moved = target.relocate_from(&source, &entry).unwrap();

    assert_eq!(moved.file_id, 2);
    assert_eq!(moved.sequence_number, entry.sequence_number);
    assert_eq!(target.read_value(&entry.key, &moved).unwrap(), b"value-1".to_vec());

    let target_entries: Vec<_> = target.index_file().iter().unwrap().map(|(_, e)| e).collect();
    assert_eq!(target_entries.len(), 1);
    assert_eq!(target_entries[0].record_offset, 0);
    assert_eq!(target_entries[0].record_size, entry.record_size);
}

#[test]
fn test_delete_removes_both_files() {
    let temp = TempDir::new().unwrap();
    let file = data_file(temp.path(), 4);
    write_records(&file, 1);

    file.delete().unwrap();
    assert!(!segment_path(temp.path(), 4, FileKind::Data).exists());
    assert!(!segment_path(temp.path(), 4, FileKind::Index).exists());
}

#[test]
fn test_compaction_flag_reports_seal_state() {
    let temp = TempDir::new().unwrap();
    let file = data_file(temp.path(), 1);

    assert!(!file.request_compaction_on_seal());
    assert!(file.seal().unwrap());
    assert!(file.request_compaction_on_seal());

    assert!(file.try_mark_queued());
    assert!(!file.try_mark_queued());
}

// =============================================================================
// Tombstone File Tests
// =============================================================================

#[test]
fn test_tombstone_write_and_iterate() {
    let temp = TempDir::new().unwrap();
    let file = TombstoneFile::create(temp.path(), 7, FLUSH_THRESHOLD).unwrap();
    for i in 0..3 {
        file.write(&TombstoneFileEntry::new(vec![i], i as i64 + 10)).unwrap();
    }
    file.flush_to_disk().unwrap();

    let reopened = TombstoneFile::open(temp.path(), 7, FLUSH_THRESHOLD).unwrap();
    let seqs: Vec<_> = reopened.iter().unwrap().map(|(_, e)| e.sequence_number).collect();
    assert_eq!(seqs, vec![10, 11, 12]);
    assert_eq!(
        reopened.write_offset() as usize,
        3 * (TombstoneFileEntry::HEADER_SIZE + 1)
    );
}

#[test]
fn test_tombstone_promote_replaces_original() {
    let temp = TempDir::new().unwrap();
    let original = TombstoneFile::create(temp.path(), 2, FLUSH_THRESHOLD).unwrap();
    original.write(&TombstoneFileEntry::new(b"a".to_vec(), 1)).unwrap();
    original.write(&TombstoneFileEntry::new(b"b".to_vec(), 2)).unwrap();
    drop(original);

    let compacted = TombstoneFile::create_compacted(temp.path(), 2, FLUSH_THRESHOLD).unwrap();
    compacted.write(&TombstoneFileEntry::new(b"b".to_vec(), 2)).unwrap();
    let promoted = compacted.promote(FLUSH_THRESHOLD).unwrap();

    assert!(!segment_path(temp.path(), 2, FileKind::CompactedTombstone).exists());
    let keys: Vec<_> = promoted.iter().unwrap().map(|(_, e)| e.key).collect();
    assert_eq!(keys, vec![b"b".to_vec()]);
}

#[test]
fn test_tombstone_repair_drops_torn_entry() {
    let temp = TempDir::new().unwrap();
    {
        let file = TombstoneFile::create(temp.path(), 1, FLUSH_THRESHOLD).unwrap();
        for i in 0..4u8 {
            file.write(&TombstoneFileEntry::new(vec![i; 8], i as i64)).unwrap();
        }
        file.flush_to_disk().unwrap();
    }
    truncate_by(&segment_path(temp.path(), 1, FileKind::Tombstone), 3);

    let repaired = TombstoneFile::open(temp.path(), 1, FLUSH_THRESHOLD)
        .unwrap()
        .repair(FLUSH_THRESHOLD)
        .unwrap();
    assert_eq!(repaired.iter().unwrap().count(), 3);
    assert_eq!(
        repaired.write_offset() as usize,
        3 * (TombstoneFileEntry::HEADER_SIZE + 8)
    );
}
