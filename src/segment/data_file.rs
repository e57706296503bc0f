//! Data File
//!
//! A data segment and its paired index file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{info, warn};

use crate::codec::{Entry, IndexFileEntry, Record};
use crate::directory::sync_dir;
use crate::error::{DriftError, Result};
use crate::index::IndexMetadata;

use super::index_file::remove_if_exists;
use super::{repair_path, segment_path, EntryIterator, FileKind, IndexFile, SegmentFile};

/// A data segment (`<id>.data` or `<id>.datac`) plus `<id>.index`.
///
/// Shared between the thread appending to it and any number of readers.
/// Once sealed it never receives another append.
pub struct DataFile {
    id: u32,
    compacted: bool,
    dir: PathBuf,
    segment: SegmentFile,
    index_file: IndexFile,
    sealed: AtomicBool,
    /// Set when the segment crossed the compaction threshold while open
    compact_on_seal: AtomicBool,
    queued: AtomicBool,
}

impl DataFile {
    /// Create a new, writable segment; fails if the id is taken
    pub fn create(dir: &Path, id: u32, compacted: bool, flush_threshold: u64) -> Result<Self> {
        let kind = FileKind::data(compacted);
        let segment = SegmentFile::create(&segment_path(dir, id, kind), flush_threshold)?;
        let index_file = match IndexFile::create(dir, id, flush_threshold) {
            Ok(index_file) => index_file,
            Err(e) => {
                drop(segment);
                let _ = fs::remove_file(segment_path(dir, id, kind));
                return Err(e.into());
            }
        };
        Ok(Self::from_parts(id, compacted, dir, segment, index_file, false))
    }

    /// Open an existing segment for reading
    pub fn open(dir: &Path, id: u32, compacted: bool, flush_threshold: u64) -> Result<Self> {
        let kind = FileKind::data(compacted);
        let segment = SegmentFile::open(&segment_path(dir, id, kind), false, flush_threshold)?;
        let index_file = IndexFile::open(dir, id, flush_threshold).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                DriftError::Structural(format!("data file {} has no index file", id))
            } else {
                e.into()
            }
        })?;
        Ok(Self::from_parts(id, compacted, dir, segment, index_file, true))
    }

    fn from_parts(
        id: u32,
        compacted: bool,
        dir: &Path,
        segment: SegmentFile,
        index_file: IndexFile,
        sealed: bool,
    ) -> Self {
        Self {
            id,
            compacted,
            dir: dir.to_path_buf(),
            segment,
            index_file,
            sealed: AtomicBool::new(sealed),
            compact_on_seal: AtomicBool::new(false),
            queued: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Whether this is a compaction output segment
    pub fn is_compacted(&self) -> bool {
        self.compacted
    }

    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    pub fn index_file(&self) -> &IndexFile {
        &self.index_file
    }

    /// Current size in bytes
    pub fn write_offset(&self) -> u32 {
        self.segment.write_offset() as u32
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Append a record and its index entry; returns where the value landed
    pub fn write_record(&self, record: &Record) -> Result<IndexMetadata> {
        let record_offset = self.segment.append(&record.serialize())? as u32;
        let record_size = record.serialized_size() as u32;

        self.index_file.write(&IndexFileEntry::new(
            record.key.clone(),
            record_offset,
            record_size,
            record.sequence_number,
        ))?;

        Ok(IndexMetadata::new(
            self.id,
            Record::value_offset(record_offset, record.key.len()),
            record.value_size(),
            record.sequence_number,
        ))
    }

    /// Copy the record described by `entry` out of `source` into this
    /// segment, byte for byte, and index it at its new offset.
    pub fn relocate_from(&self, source: &DataFile, entry: &IndexFileEntry) -> Result<IndexMetadata> {
        let record_offset = self.segment.append_from(
            source.path(),
            entry.record_offset as u64,
            entry.record_size as u64,
        )? as u32;

        self.index_file.write(&IndexFileEntry::new(
            entry.key.clone(),
            record_offset,
            entry.record_size,
            entry.sequence_number,
        ))?;

        Ok(IndexMetadata::new(
            self.id,
            Record::value_offset(record_offset, entry.key.len()),
            entry.value_size(),
            entry.sequence_number,
        ))
    }

    /// Data-only sync of the segment and its index
    pub fn flush(&self) -> Result<()> {
        self.segment.flush()?;
        self.index_file.flush()
    }

    /// Full sync of the segment and its index
    pub fn flush_to_disk(&self) -> Result<()> {
        self.segment.flush_to_disk()?;
        self.index_file.flush_to_disk()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Raw positional read
    pub fn read(&self, offset: u32, len: u32) -> Result<Vec<u8>> {
        Ok(self.segment.read_at(offset as u64, len as usize)?)
    }

    /// Read and verify the record starting at `record_offset`
    pub fn read_record(&self, record_offset: u32, key_len: usize, value_len: u32) -> Result<Record> {
        let size = Record::size_of(key_len, value_len as usize);
        let bytes = self.segment.read_at(record_offset as u64, size)?;
        Record::deserialize(&bytes).map_err(|_| DriftError::Checksum {
            file: self.path().to_path_buf(),
            offset: record_offset as u64,
        })
    }

    /// Read the value `metadata` points at, verifying the whole record
    pub fn read_value(&self, key: &[u8], metadata: &IndexMetadata) -> Result<Vec<u8>> {
        let record_offset = metadata.value_offset - (Record::HEADER_SIZE + key.len()) as u32;
        let record = self.read_record(record_offset, key.len(), metadata.value_size)?;
        if record.key != key || record.sequence_number != metadata.sequence_number {
            return Err(DriftError::Checksum {
                file: self.path().to_path_buf(),
                offset: record_offset as u64,
            });
        }
        Ok(record.value)
    }

    /// Iterate the records of this segment
    pub fn iter(&self) -> Result<EntryIterator<Record>> {
        self.segment.iter()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close for writes; returns true if the segment asked to be compacted
    /// once sealed
    pub fn seal(&self) -> Result<bool> {
        self.flush_to_disk()?;
        self.sealed.store(true, Ordering::SeqCst);
        Ok(self.compact_on_seal.load(Ordering::SeqCst))
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    /// Ask for compaction as soon as the segment is sealed; returns true if
    /// it already is
    pub fn request_compaction_on_seal(&self) -> bool {
        self.compact_on_seal.store(true, Ordering::SeqCst);
        self.is_sealed()
    }

    pub fn compaction_requested(&self) -> bool {
        self.compact_on_seal.load(Ordering::SeqCst)
    }

    /// Claim the single compaction-queue slot for this segment
    pub fn try_mark_queued(&self) -> bool {
        !self.queued.swap(true, Ordering::SeqCst)
    }

    /// Remove the segment and its index file from disk
    pub fn delete(&self) -> Result<()> {
        remove_if_exists(self.path())?;
        self.index_file.delete()
    }

    /// Rewrite the valid prefix of this segment and atomically replace the
    /// segment and its index with it. Everything from the first torn or
    /// corrupt record onwards is dropped.
    pub fn repair(self, flush_threshold: u64) -> Result<DataFile> {
        let kind = FileKind::data(self.compacted);
        let repair_segment = SegmentFile::create_truncated(&repair_path(&self.dir, self.id, kind), flush_threshold)?;
        let repair_index = IndexFile::create_repair(&self.dir, self.id, flush_threshold)?;
        let repaired = Self::from_parts(self.id, self.compacted, &self.dir, repair_segment, repair_index, false);

        let mut records = self.iter()?;
        let mut kept = 0u64;
        for (_, record) in records.by_ref() {
            repaired.write_record(&record)?;
            kept += 1;
        }
        repaired.flush_to_disk()?;

        if let Some(offset) = records.corruption() {
            warn!(
                file_id = self.id,
                offset,
                dropped_bytes = self.segment.write_offset() - offset,
                "truncated torn tail of data file"
            );
        }
        info!(file_id = self.id, records = kept, "data file repaired");

        let repaired_index_path = repaired.index_file.path().to_path_buf();
        let repaired_path = repaired.path().to_path_buf();
        let index_path = self.index_file.path().to_path_buf();
        let path = self.path().to_path_buf();
        let dir = self.dir.clone();
        let (id, compacted) = (self.id, self.compacted);
        drop(repaired);
        drop(self);

        fs::rename(&repaired_index_path, &index_path)?;
        fs::rename(&repaired_path, &path)?;
        sync_dir(&dir)?;

        Self::open(&dir, id, compacted, flush_threshold)
    }
}
