//! State shared by the writer, readers and the compaction worker.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::compaction::{CompactionQueue, StaleMap};
use crate::config::Config;
use crate::directory::{sync_dir, DbMetadata};
use crate::error::{DriftError, Result};
use crate::index::IndexMap;
use crate::segment::{remove_if_exists, segment_path, DataFile, FileKind};

/// One per open database; the engine and the compaction worker each hold
/// an `Arc` to it.
///
/// ## Lock order
/// `data_files` before `tombstone_last_data`; neither is held across I/O
/// on a segment.
pub(crate) struct Shared {
    pub config: Config,
    pub dir: PathBuf,
    pub index: Box<dyn IndexMap>,

    /// Every data segment that exists on disk, by id
    pub data_files: RwLock<BTreeMap<u32, Arc<DataFile>>>,

    pub stale: StaleMap,

    /// tombstone file id -> highest data file id it may shadow
    pub tombstone_last_data: Mutex<BTreeMap<u32, u32>>,

    /// Shared by data, index and tombstone files
    pub next_file_id: AtomicU32,

    /// Tombstone file the writer appends to, 0 if none
    pub current_tombstone: AtomicU32,

    pub metadata: Mutex<DbMetadata>,
    pub compaction: CompactionQueue,
    pub closed: AtomicBool,
}

impl Shared {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // =========================================================================
    // File creation
    // =========================================================================

    /// Run `create` with fresh ids until one does not collide
    pub fn create_with_fresh_id<T>(&self, create: impl Fn(u32) -> Result<T>) -> Result<T> {
        loop {
            let id = self.next_file_id.fetch_add(1, Ordering::SeqCst);
            match create(id) {
                Err(DriftError::Io(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                    warn!(file_id = id, "file id already taken, retrying");
                }
                other => return other,
            }
        }
    }

    /// Create a data segment and publish it in the data file map
    pub fn create_data_file(&self, compacted: bool) -> Result<Arc<DataFile>> {
        let threshold = self.config.data_flush_threshold;
        let file = self.create_with_fresh_id(|id| {
            DataFile::create(&self.dir, id, compacted, threshold)
        })?;
        let file = Arc::new(file);

        self.data_files.write().insert(file.id(), Arc::clone(&file));
        sync_dir(&self.dir)?;
        debug!(file_id = file.id(), compacted, "created data file");
        Ok(file)
    }

    // =========================================================================
    // Stale accounting
    // =========================================================================

    /// Credit `bytes` of `file_id` as unreachable and admit the file into
    /// compaction once it crosses the threshold. A segment still receiving
    /// writes is only flagged; it is queued when sealed.
    pub fn mark_stale(&self, file_id: u32, bytes: u32) {
        let total = self.stale.record(file_id, bytes);
        let file = self.data_files.read().get(&file_id).cloned();

        let Some(file) = file else {
            self.stale.remove(file_id);
            return;
        };

        let limit = self.config.compaction_threshold * file.write_offset() as f64;
        if total as f64 > limit {
            self.stale.remove(file_id);
            if file.request_compaction_on_seal() {
                self.compaction.queue(&file);
            } else {
                debug!(file_id, stale = total, "open segment flagged for compaction");
            }
        }
    }

    /// Queue every stale-heavy segment left over from recovery
    pub fn admit_stale_files(&self) -> usize {
        let mut queued = 0;
        for (file_id, total) in self.stale.snapshot() {
            let file = self.data_files.read().get(&file_id).cloned();
            match file {
                None => self.stale.remove(file_id),
                Some(file) => {
                    if total as f64 > self.config.compaction_threshold * file.write_offset() as f64 {
                        self.stale.remove(file_id);
                        if file.request_compaction_on_seal() && self.compaction.queue(&file) {
                            queued += 1;
                        }
                    }
                }
            }
        }
        queued
    }

    /// Drop a compacted segment from the map and from disk
    pub fn mark_compacted(&self, file: &DataFile) -> Result<()> {
        self.stale.remove(file.id());
        self.data_files.write().remove(&file.id());
        file.delete()?;
        sync_dir(&self.dir)?;
        Ok(())
    }

    // =========================================================================
    // Tombstones
    // =========================================================================

    /// Record that `tombstone_id` may shadow every data file present now
    pub fn associate_tombstone(&self, tombstone_id: u32) {
        let newest = self.data_files.read().keys().next_back().copied().unwrap_or(0);
        let mut map = self.tombstone_last_data.lock();
        let last = map.entry(tombstone_id).or_insert(0);
        *last = (*last).max(newest);
    }

    /// Delete tombstone files whose every shadowed data file is gone. The
    /// writer's current tombstone file is never deleted.
    pub fn delete_orphaned_tombstones(&self) -> Result<()> {
        let current = self.current_tombstone.load(Ordering::SeqCst);
        let mut orphaned = Vec::new();
        {
            let data_files = self.data_files.read();
            let mut map = self.tombstone_last_data.lock();
            map.retain(|&tombstone_id, &mut last| {
                let live = tombstone_id == current || data_files.range(..=last).next().is_some();
                if !live {
                    orphaned.push(tombstone_id);
                }
                live
            });
        }

        for tombstone_id in orphaned {
            remove_if_exists(&segment_path(&self.dir, tombstone_id, FileKind::Tombstone))?;
            info!(file_id = tombstone_id, "deleted orphaned tombstone file");
        }
        Ok(())
    }

    // =========================================================================
    // Superblock
    // =========================================================================

    /// Persist the I/O error flag so the next open repairs the tails
    pub fn record_io_error(&self, cause: &io::Error) {
        error!(error = %cause, "write failed, flagging database for repair");
        let mut metadata = self.metadata.lock();
        if metadata.io_error() {
            return;
        }
        metadata.set_io_error(true);
        if let Err(e) = metadata.save() {
            error!(error = %e, "failed to persist io error flag");
        }
    }
}
