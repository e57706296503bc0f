//! Index File
//!
//! Side-car log of [`IndexFileEntry`] paired with a data segment by id.

use std::fs;
use std::io;
use std::path::Path;

use crate::codec::{Entry, IndexFileEntry};
use crate::error::Result;

use super::{repair_path, segment_path, EntryIterator, FileKind, SegmentFile};

pub struct IndexFile {
    id: u32,
    segment: SegmentFile,
}

impl IndexFile {
    /// Create `<id>.index`; fails if it already exists
    pub fn create(dir: &Path, id: u32, flush_threshold: u64) -> io::Result<Self> {
        let segment = SegmentFile::create(&segment_path(dir, id, FileKind::Index), flush_threshold)?;
        Ok(Self { id, segment })
    }

    /// Create `<id>.index.repair`, replacing a leftover from an earlier attempt
    pub(crate) fn create_repair(dir: &Path, id: u32, flush_threshold: u64) -> io::Result<Self> {
        let segment =
            SegmentFile::create_truncated(&repair_path(dir, id, FileKind::Index), flush_threshold)?;
        Ok(Self { id, segment })
    }

    /// Open an existing `<id>.index`
    pub fn open(dir: &Path, id: u32, flush_threshold: u64) -> io::Result<Self> {
        let segment =
            SegmentFile::open(&segment_path(dir, id, FileKind::Index), false, flush_threshold)?;
        Ok(Self { id, segment })
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

    pub fn write(&self, entry: &IndexFileEntry) -> Result<()> {
        self.segment.append(&entry.serialize())?;
        Ok(())
    }

    pub fn iter(&self) -> Result<EntryIterator<IndexFileEntry>> {
        self.segment.iter()
    }

    pub fn flush(&self) -> Result<()> {
        self.segment.flush()?;
        Ok(())
    }

    pub fn flush_to_disk(&self) -> Result<()> {
        self.segment.flush_to_disk()?;
        Ok(())
    }

    pub fn delete(&self) -> Result<()> {
        remove_if_exists(self.path())
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
