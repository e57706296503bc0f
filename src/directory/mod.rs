//! Directory Module
//!
//! The database directory: which numbered files exist, and the superblock.
//!
//! ## Layout
//! ```text
//! <data_dir>/
//!   METADATA            superblock (11 bytes)
//!   METADATA.tmp        transient, replaced via rename
//!   1.data  1.index     ┐
//!   2.datac 2.index     ├ data segments, oldest first
//!   3.data  3.index     ┘
//!   4.tombstone         tombstone logs
//! ```

mod metadata;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{DriftError, Result};
use crate::segment::{FileKind, REPAIR_SUFFIX};

pub use metadata::{DbMetadata, METADATA_FILE_NAME};

/// Snapshot of the numbered files in a database directory
#[derive(Debug, Default, Clone)]
pub struct DbDirectory {
    path: PathBuf,
    /// data file id -> compacted
    data_files: BTreeMap<u32, bool>,
    index_files: Vec<u32>,
    tombstone_files: Vec<u32>,
    compacted_tombstone_files: Vec<u32>,
    repair_files: Vec<PathBuf>,
}

impl DbDirectory {
    /// Create the directory if needed and list its contents
    pub fn open(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)?;
        Self::scan(path)
    }

    /// List the directory.
    ///
    /// A data id that appears both as `.data` and `.datac` is a structural
    /// error: the two would share one index file.
    pub fn scan(path: &Path) -> Result<Self> {
        let mut listing = Self {
            path: path.to_path_buf(),
            ..Self::default()
        };

        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };

            if name.ends_with(REPAIR_SUFFIX) {
                listing.repair_files.push(entry.path());
                continue;
            }

            match FileKind::parse(name) {
                Some((FileKind::Data, id)) => listing.add_data(id, false)?,
                Some((FileKind::CompactedData, id)) => listing.add_data(id, true)?,
                Some((FileKind::Index, id)) => listing.index_files.push(id),
                Some((FileKind::Tombstone, id)) => listing.tombstone_files.push(id),
                Some((FileKind::CompactedTombstone, id)) => {
                    listing.compacted_tombstone_files.push(id)
                }
                None => {}
            }
        }

        listing.index_files.sort_unstable();
        listing.tombstone_files.sort_unstable();
        listing.compacted_tombstone_files.sort_unstable();

        debug!(
            path = %path.display(),
            data_files = listing.data_files.len(),
            tombstone_files = listing.tombstone_files.len(),
            "scanned database directory"
        );
        Ok(listing)
    }

    fn add_data(&mut self, id: u32, compacted: bool) -> Result<()> {
        if self.data_files.insert(id, compacted).is_some() {
            return Err(DriftError::Structural(format!(
                "data file id {} exists both as .data and .datac",
                id
            )));
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// (id, compacted) of every data file, ascending
    pub fn data_files(&self) -> impl Iterator<Item = (u32, bool)> + '_ {
        self.data_files.iter().map(|(&id, &compacted)| (id, compacted))
    }

    pub fn has_data_file(&self, id: u32) -> bool {
        self.data_files.contains_key(&id)
    }

    pub fn index_files(&self) -> &[u32] {
        &self.index_files
    }

    pub fn tombstone_files(&self) -> &[u32] {
        &self.tombstone_files
    }

    pub fn compacted_tombstone_files(&self) -> &[u32] {
        &self.compacted_tombstone_files
    }

    /// Leftovers of an interrupted tail repair
    pub fn repair_files(&self) -> &[PathBuf] {
        &self.repair_files
    }

    /// Newest data file of each flavour: (uncompacted, compacted)
    pub fn newest_data_files(&self) -> (Option<u32>, Option<u32>) {
        let newest = |want: bool| {
            self.data_files
                .iter()
                .rev()
                .find(|(_, &compacted)| compacted == want)
                .map(|(&id, _)| id)
        };
        (newest(false), newest(true))
    }

    /// Highest id among every numbered file, 0 for an empty directory
    pub fn max_file_id(&self) -> u32 {
        let data = self.data_files.keys().next_back().copied();
        [
            data,
            self.index_files.last().copied(),
            self.tombstone_files.last().copied(),
            self.compacted_tombstone_files.last().copied(),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.data_files.is_empty() && self.tombstone_files.is_empty()
    }
}

/// Make renames and file creations in `dir` durable
#[cfg(unix)]
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// Directories cannot be opened as files on this platform; renames are
/// already durable once the call returns
#[cfg(not(unix))]
pub fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
