//! Tombstone File
//!
//! Append log of deletions, rolled over independently of data segments.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::codec::{Entry, TombstoneFileEntry};
use crate::directory::sync_dir;
use crate::error::Result;

use super::index_file::remove_if_exists;
use super::{repair_path, segment_path, EntryIterator, FileKind, SegmentFile};

pub struct TombstoneFile {
    id: u32,
    kind: FileKind,
    dir: PathBuf,
    segment: SegmentFile,
}

impl TombstoneFile {
    /// Create `<id>.tombstone`; fails if the id is taken
    pub fn create(dir: &Path, id: u32, flush_threshold: u64) -> io::Result<Self> {
        let path = segment_path(dir, id, FileKind::Tombstone);
        let segment = SegmentFile::create(&path, flush_threshold)?;
        Ok(Self::from_parts(dir, id, FileKind::Tombstone, segment))
    }

    /// Create `<id>.tombstonec`, the rewrite target of a tombstone file
    pub fn create_compacted(dir: &Path, id: u32, flush_threshold: u64) -> io::Result<Self> {
        let path = segment_path(dir, id, FileKind::CompactedTombstone);
        let segment = SegmentFile::create_truncated(&path, flush_threshold)?;
        Ok(Self::from_parts(dir, id, FileKind::CompactedTombstone, segment))
    }

    /// Open an existing `<id>.tombstone` for reading
    pub fn open(dir: &Path, id: u32, flush_threshold: u64) -> io::Result<Self> {
        let path = segment_path(dir, id, FileKind::Tombstone);
        let segment = SegmentFile::open(&path, false, flush_threshold)?;
        Ok(Self::from_parts(dir, id, FileKind::Tombstone, segment))
    }

    fn from_parts(dir: &Path, id: u32, kind: FileKind, segment: SegmentFile) -> Self {
        Self {
            id,
            kind,
            dir: dir.to_path_buf(),
            segment,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn path(&self) -> &Path {
        self.segment.path()
    }

    pub fn write_offset(&self) -> u64 {
        self.segment.write_offset()
    }

    pub fn write(&self, entry: &TombstoneFileEntry) -> Result<()> {
        self.segment.append(&entry.serialize())?;
        Ok(())
    }

    pub fn iter(&self) -> Result<EntryIterator<TombstoneFileEntry>> {
        self.segment.iter()
    }

    pub fn flush_to_disk(&self) -> Result<()> {
        self.segment.flush_to_disk()?;
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        remove_if_exists(self.path())
    }

    /// Atomically replace `<id>.tombstone` with this `<id>.tombstonec`
    pub fn promote(self, flush_threshold: u64) -> Result<TombstoneFile> {
        debug_assert_eq!(self.kind, FileKind::CompactedTombstone);
        self.flush_to_disk()?;

        let (dir, id) = (self.dir.clone(), self.id);
        let from = self.path().to_path_buf();
        drop(self);

        fs::rename(&from, segment_path(&dir, id, FileKind::Tombstone))?;
        sync_dir(&dir)?;
        Ok(Self::open(&dir, id, flush_threshold)?)
    }

    /// Rewrite the valid prefix and atomically replace the original
    pub fn repair(self, flush_threshold: u64) -> Result<TombstoneFile> {
        let repair = repair_path(&self.dir, self.id, FileKind::Tombstone);
        let repaired = SegmentFile::create_truncated(&repair, flush_threshold)?;

        let mut entries = self.iter()?;
        let mut kept = 0u64;
        for (_, entry) in entries.by_ref() {
            repaired.append(&entry.serialize())?;
            kept += 1;
        }
        repaired.flush_to_disk()?;

        if let Some(offset) = entries.corruption() {
            warn!(
                file_id = self.id,
                offset,
                dropped_bytes = self.segment.write_offset() - offset,
                "truncated torn tail of tombstone file"
            );
        }
        info!(file_id = self.id, entries = kept, "tombstone file repaired");

        let (dir, id) = (self.dir.clone(), self.id);
        let path = self.path().to_path_buf();
        drop(repaired);
        drop(self);

        fs::rename(&repair, &path)?;
        sync_dir(&dir)?;
        Ok(Self::open(&dir, id, flush_threshold)?)
    }
}
