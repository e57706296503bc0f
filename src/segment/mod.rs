//! Segment Store Module
//!
//! Append-only files identified by a numeric id.
//!
//! ## Responsibilities
//! - Exclusive creation (an id collision fails loudly, the caller retries)
//! - Write offset tracking, published only after the bytes are written
//! - Threshold-based data sync, full sync on seal/close
//! - Forward iteration that stops at end-of-file or the first bad checksum
//! - Tail repair: rewrite the valid prefix, then atomically replace
//!
//! ## Files
//! ```text
//! <id>.data        live data segment           ─┐ paired
//! <id>.datac       compaction output segment    ├─ by id
//! <id>.index       side-car index entries      ─┘
//! <id>.tombstone   tombstone log
//! <id>.tombstonec  transient merge artifact
//! <name>.repair    transient tail-repair artifact
//! ```

mod data_file;
mod file;
mod index_file;
mod tombstone_file;

use std::path::{Path, PathBuf};

pub use data_file::DataFile;
pub use file::EntryIterator;
pub use index_file::IndexFile;
pub use tombstone_file::TombstoneFile;

pub(crate) use file::SegmentFile;
pub(crate) use index_file::remove_if_exists;

/// Suffix appended to a file name while its repaired copy is being written
pub(crate) const REPAIR_SUFFIX: &str = ".repair";

// =============================================================================
// File Kinds
// =============================================================================

/// Every kind of numbered file that lives in the database directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Data,
    CompactedData,
    Index,
    Tombstone,
    CompactedTombstone,
}

impl FileKind {
    pub const ALL: [FileKind; 5] = [
        FileKind::Data,
        FileKind::CompactedData,
        FileKind::Index,
        FileKind::Tombstone,
        FileKind::CompactedTombstone,
    ];

    pub fn extension(self) -> &'static str {
        match self {
            FileKind::Data => "data",
            FileKind::CompactedData => "datac",
            FileKind::Index => "index",
            FileKind::Tombstone => "tombstone",
            FileKind::CompactedTombstone => "tombstonec",
        }
    }

    /// Data segment kind for the given compaction flag
    pub fn data(compacted: bool) -> Self {
        if compacted {
            FileKind::CompactedData
        } else {
            FileKind::Data
        }
    }

    /// "42.data" -> Some((Data, 42))
    pub fn parse(file_name: &str) -> Option<(FileKind, u32)> {
        let (stem, ext) = file_name.split_once('.')?;
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let kind = FileKind::ALL.into_iter().find(|k| k.extension() == ext)?;
        let id = stem.parse().ok()?;
        Some((kind, id))
    }
}

/// `{dir}/{id}.{ext}`
pub fn segment_path(dir: &Path, id: u32, kind: FileKind) -> PathBuf {
    dir.join(format!("{}.{}", id, kind.extension()))
}

/// `{dir}/{id}.{ext}.repair`
pub(crate) fn repair_path(dir: &Path, id: u32, kind: FileKind) -> PathBuf {
    dir.join(format!("{}.{}{}", id, kind.extension(), REPAIR_SUFFIX))
}
