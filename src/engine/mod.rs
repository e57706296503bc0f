//! Engine Module
//!
//! The storage engine that coordinates all components.
//!
//! ## Responsibilities
//! - Open: validate the superblock, run recovery, start compaction
//! - Serve lock-free reads from the index and immutable segment bytes
//! - Serialize every mutation through the single-writer region
//! - Close: stop compaction, seal segments, clear the open flag
//!
//! ```text
//!            put / delete                     get
//!                 │                            │
//!        ┌────────▼────────┐                   │
//!        │  writer (Mutex) │                   │
//!        └──┬──────────┬───┘                   │
//!   append  │          │ publish        lookup │
//!           ▼          ▼                       ▼
//!   ┌────────────┐  ┌──────────────────────────────┐
//!   │  segments  │  │          IndexMap            │
//!   └─────▲──────┘  └──────────────▲───────────────┘
//!         │ relocate               │ relocate (same seq)
//!         └──────── compaction worker ─────────┘
//! ```

mod shared;
mod write;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::command::GetResult;
use crate::compaction::{CompactionManager, CompactionQueue};
use crate::config::Config;
use crate::directory::{DbDirectory, DbMetadata};
use crate::error::{DriftError, Result};
use crate::index::{IndexMap, OnHeapIndex};
use crate::recovery::{self, RecoveryResult};

pub(crate) use shared::Shared;
use write::WriterState;

/// Point-in-time counters, mostly for operators and tests
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub live_keys: usize,
    pub data_files: usize,
    pub tombstone_files: usize,
    /// Stale bytes per data file not yet admitted into compaction
    pub stale_bytes: BTreeMap<u32, u32>,
    pub pending_compactions: usize,
    pub compactions_completed: u64,
    pub compactions_failed: u64,
}

/// The main storage engine
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader
///
/// - **Writes** (put/replace/delete and their variants): serialized by
///   `writer`. Internal helpers take `&mut WriterState` instead of locking
///   again, so nested calls never deadlock.
///
/// - **Reads** (get): never take the writer lock. The index is a concurrent
///   map and segment bytes below a published write offset are immutable.
///
/// - **Compaction**: one background thread sharing [`Shared`] with the
///   engine; it only ever moves a key without changing its sequence number.
pub struct Engine {
    shared: Arc<Shared>,
    writer: Mutex<WriterState>,
    compaction: CompactionManager,
    recovery: RecoveryResult,
}

impl Engine {
    /// Open or create a database
    ///
    /// On startup:
    /// 1. Validate options, list the directory
    /// 2. Load the superblock; a changed `max_file_size` is fatal
    /// 3. Persist `open=true` (the dirty-shutdown marker)
    /// 4. Recover, repairing tails if the last run was not closed cleanly
    /// 5. Start the compaction worker and admit stale-heavy segments
    pub fn open(config: Config) -> Result<Self> {
        // Step 1: Options and directory
        config.validate()?;
        let directory = DbDirectory::open(&config.data_dir)?;

        // Step 2: Superblock
        let mut metadata = DbMetadata::load(directory.path())?;
        let stored_max_file_size = metadata.max_file_size();
        if stored_max_file_size != 0 && stored_max_file_size != config.max_file_size {
            return Err(DriftError::Config(format!(
                "max_file_size cannot change after creation: stored {}, configured {}",
                stored_max_file_size, config.max_file_size
            )));
        }
        let needs_repair = metadata.superblock().needs_repair();
        if needs_repair {
            warn!(
                open = metadata.is_open(),
                io_error = metadata.io_error(),
                "previous run did not shut down cleanly, repair required"
            );
        }

        // Step 3: Mark open
        metadata.set_open(true);
        metadata.set_io_error(false);
        metadata.set_max_file_size(config.max_file_size);
        metadata.save()?;

        // Step 4: Recovery
        let index: Box<dyn IndexMap> = Box::new(OnHeapIndex::new());
        let recovered = recovery::recover(&config, &directory, needs_repair, index.as_ref())?;

        let writer = WriterState::new(recovered.max_sequence_number + 1);
        let shared = Arc::new(Shared {
            dir: directory.path().to_path_buf(),
            index,
            data_files: RwLock::new(recovered.data_files),
            stale: recovered.stale,
            tombstone_last_data: Mutex::new(recovered.tombstone_last_data),
            next_file_id: AtomicU32::new(recovered.max_file_id + 1),
            current_tombstone: AtomicU32::new(0),
            metadata: Mutex::new(metadata),
            compaction: CompactionQueue::new(),
            closed: AtomicBool::new(false),
            config,
        });

        // Step 5: Compaction
        let compaction = CompactionManager::start(&shared)?;
        let queued = shared.admit_stale_files();

        info!(
            path = %shared.dir.display(),
            keys = shared.index.len(),
            data_files = shared.data_files.read().len(),
            next_sequence_number = writer.next_sequence_number,
            queued_for_compaction = queued,
            "database opened"
        );

        Ok(Self {
            shared,
            writer: Mutex::new(writer),
            compaction,
            recovery: recovered.result,
        })
    }

    /// Open with a path (convenience method)
    ///
    /// Uses default config with the specified data directory
    pub fn open_path(path: &Path) -> Result<Self> {
        Self::open(Config::builder().data_dir(path).build())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Get the value of a key together with its sequence number
    pub fn get(&self, key: &[u8]) -> Result<GetResult> {
        if self.shared.is_closed() {
            return Err(DriftError::Closed);
        }

        let Some(mut metadata) = self.shared.index.get(key) else {
            return Ok(GetResult::absent());
        };

        loop {
            let file = self.shared.data_files.read().get(&metadata.file_id).cloned();
            if let Some(file) = file {
                let value = file.read_value(key, &metadata)?;
                return Ok(GetResult::found(value, metadata.sequence_number));
            }

            // The segment was compacted away after the lookup; the key has
            // been relocated, overwritten or deleted since.
            match self.shared.index.get(key) {
                None => return Ok(GetResult::absent()),
                Some(latest) if latest != metadata => metadata = latest,
                Some(_) => {
                    return Err(DriftError::Structural(format!(
                        "index points at missing data file {}",
                        metadata.file_id
                    )))
                }
            }
        }
    }

    /// Whether the key currently has a value
    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        if self.shared.is_closed() {
            return Err(DriftError::Closed);
        }
        Ok(self.shared.index.get(key).is_some())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Close the engine gracefully
    ///
    /// Takes the writer lock so no mutation races shutdown. Stops the
    /// compaction worker, seals open segments, then persists `open=false`.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.compaction.stop(&self.shared);
        writer.close()?;

        {
            let mut metadata = self.shared.metadata.lock();
            metadata.set_open(false);
            metadata.save()?;
        }
        self.shared.index.close();

        info!(path = %self.shared.dir.display(), "database closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    // =========================================================================
    // Accessors (for testing and debugging)
    // =========================================================================

    /// Get the data directory path
    pub fn data_dir(&self) -> &Path {
        &self.shared.dir
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// What the recovery at open found
    pub fn recovery_result(&self) -> &RecoveryResult {
        &self.recovery
    }

    pub fn stats(&self) -> EngineStats {
        let (data_files, live_keys) = (
            self.shared.data_files.read().len(),
            self.shared.index.len(),
        );
        EngineStats {
            live_keys,
            data_files,
            tombstone_files: self.shared.tombstone_last_data.lock().len(),
            stale_bytes: self.shared.stale.snapshot().into_iter().collect(),
            pending_compactions: self.shared.compaction.pending(),
            compactions_completed: self.shared.compaction.completed(),
            compactions_failed: self.shared.compaction.failed(),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.shared.is_closed() {
            if let Err(e) = self.close() {
                error!(error = %e, "failed to close database on drop");
            }
        }
    }
}
