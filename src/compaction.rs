//! Compaction
//!
//! Reclaims the space held by superseded and deleted records.
//!
//! ## Admission
//! ```text
//!  writer / recovery ──credit stale bytes──► StaleMap[file]
//!                                              │ stale > threshold × size
//!                                              ▼
//!                         sealed? ──yes──► queue ──► worker
//!                            │no
//!                            └──► flagged, queued by whoever seals it
//! ```
//!
//! ## Job
//! For each entry of the segment's index file the worker recomputes where
//! the value would live and compares it with the index (freshness check).
//! Live records are copied byte for byte into the worker's own output
//! segment (`<id>.datac`) and republished with `IndexMap::relocate`. A failed
//! republish means a writer got there first; the copied bytes are credited
//! as stale to the output segment. The source segment is deleted at the end.
//!
//! The output segment is sealed on rollover, at the end of a job if it went
//! stale meanwhile, or on the next idle poll once writers have superseded it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::engine::Shared;
use crate::error::{DriftError, Result};
use crate::index::IndexMetadata;
use crate::segment::DataFile;

// =============================================================================
// Stale-byte accounting
// =============================================================================

/// file id -> bytes of that file no longer reachable from the index
#[derive(Debug, Default)]
pub(crate) struct StaleMap {
    inner: Mutex<HashMap<u32, u32>>,
}

impl StaleMap {
    /// Credit `bytes` to `file_id`, returning the new total
    pub fn record(&self, file_id: u32, bytes: u32) -> u32 {
        let mut inner = self.inner.lock();
        let total = inner.entry(file_id).or_insert(0);
        *total = total.saturating_add(bytes);
        *total
    }

    pub fn remove(&self, file_id: u32) {
        self.inner.lock().remove(&file_id);
    }

    pub fn snapshot(&self) -> HashMap<u32, u32> {
        self.inner.lock().clone()
    }
}

// =============================================================================
// Queue & state machine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompactionState {
    NotStarted = 0,
    Running = 1,
    Stopped = 2,
}

impl CompactionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CompactionState::NotStarted,
            1 => CompactionState::Running,
            _ => CompactionState::Stopped,
        }
    }
}

/// FIFO of segments waiting for the worker, bounded only by memory
pub(crate) struct CompactionQueue {
    state: AtomicU8,
    tx: Sender<Arc<DataFile>>,
    rx: Receiver<Arc<DataFile>>,
    completed: AtomicU64,
    failed: AtomicU64,
}

impl CompactionQueue {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            state: AtomicU8::new(CompactionState::NotStarted as u8),
            tx,
            rx,
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CompactionState {
        CompactionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: CompactionState, to: CompactionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Queue a sealed segment. Refused unless running, and a segment is
    /// queued at most once.
    pub fn queue(&self, file: &Arc<DataFile>) -> bool {
        if self.state() != CompactionState::Running {
            return false;
        }
        if !file.try_mark_queued() {
            return false;
        }
        debug!(file_id = file.id(), "queued for compaction");
        self.tx.send(Arc::clone(file)).is_ok()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Owns the worker thread
pub(crate) struct CompactionManager {
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CompactionManager {
    /// Move the queue to `Running` and spawn the worker
    pub fn start(shared: &Arc<Shared>) -> Result<Self> {
        if !shared
            .compaction
            .transition(CompactionState::NotStarted, CompactionState::Running)
        {
            return Err(DriftError::InvalidArgument(format!(
                "compaction cannot start from {:?}",
                shared.compaction.state()
            )));
        }

        let worker = CompactionWorker {
            shared: Arc::clone(shared),
            rx: shared.compaction.rx.clone(),
            output: None,
        };
        let handle = thread::Builder::new()
            .name("driftkv-compaction".into())
            .spawn(move || worker.run())?;

        info!("compaction worker started");
        Ok(Self {
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop accepting work and wait for the worker to finish its current job
    pub fn stop(&self, shared: &Shared) {
        shared
            .compaction
            .transition(CompactionState::Running, CompactionState::Stopped);

        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!("compaction worker panicked");
            }
            info!("compaction worker stopped");
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

struct CompactionWorker {
    shared: Arc<Shared>,
    rx: Receiver<Arc<DataFile>>,
    /// Current output segment, kept across jobs until full
    output: Option<Arc<DataFile>>,
}

impl CompactionWorker {
    fn run(mut self) {
        let poll_interval = self.shared.config.compaction_poll_interval;

        while self.shared.compaction.state() == CompactionState::Running {
            match self.rx.recv_timeout(poll_interval) {
                Ok(file) => self.run_job(file),
                Err(RecvTimeoutError::Timeout) => self.seal_output_if_flagged(),
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Err(e) = self.seal_output() {
            error!(error = %e, "failed to seal compaction output");
        }
    }

    fn run_job(&mut self, file: Arc<DataFile>) {
        let file_id = file.id();
        info!(file_id, size = file.write_offset(), "compacting data file");

        match self.compact(&file) {
            Ok(relocated) => {
                self.shared.compaction.completed.fetch_add(1, Ordering::Relaxed);
                info!(file_id, relocated, "compaction finished");
            }
            Err(e) => {
                // Left on disk and in the data file map; not retried
                self.shared.compaction.failed.fetch_add(1, Ordering::Relaxed);
                error!(file_id, error = %e, "compaction failed");
            }
        }
    }

    /// Relocate every live record of `file`, then delete it
    fn compact(&mut self, file: &Arc<DataFile>) -> Result<u64> {
        let mut relocated = 0u64;
        let mut entries = file.index_file().iter()?;

        for (_, entry) in entries.by_ref() {
            let candidate = IndexMetadata::new(
                file.id(),
                entry.value_offset(),
                entry.value_size(),
                entry.sequence_number,
            );
            if self.shared.index.get(&entry.key) != Some(candidate) {
                continue;
            }

            // Room is made before the freshness check so that a delete
            // racing with the copy already sees the output segment.
            let output = self.output_for(entry.record_size)?;
            if self.shared.index.get(&entry.key) != Some(candidate) {
                continue;
            }

            let moved = output.relocate_from(file, &entry)?;
            if self.shared.index.relocate(&entry.key, &candidate, moved) {
                relocated += 1;
            } else {
                self.shared.mark_stale(output.id(), entry.record_size);
            }
        }

        if let Some(offset) = entries.corruption() {
            return Err(DriftError::Checksum {
                file: file.index_file().path().to_path_buf(),
                offset,
            });
        }

        if let Some(output) = &self.output {
            output.flush_to_disk()?;
            if output.compaction_requested() {
                self.seal_output()?;
            }
        }

        self.shared.mark_compacted(file)?;
        self.shared.delete_orphaned_tombstones()?;
        Ok(relocated)
    }

    /// The output segment, rolled over if `record_size` does not fit
    fn output_for(&mut self, record_size: u32) -> Result<Arc<DataFile>> {
        let max_file_size = self.shared.config.max_file_size as u64;
        if let Some(output) = &self.output {
            if output.write_offset() as u64 + record_size as u64 <= max_file_size {
                return Ok(Arc::clone(output));
            }
            self.seal_output()?;
        }

        let output = self.shared.create_data_file(true)?;
        debug!(file_id = output.id(), "opened compaction output");
        self.output = Some(Arc::clone(&output));
        Ok(output)
    }

    /// Seal and queue the output once writers pushed it over the threshold
    fn seal_output_if_flagged(&mut self) {
        let flagged = matches!(&self.output, Some(output) if output.compaction_requested());
        if !flagged {
            return;
        }
        debug!("sealing stale compaction output");
        if let Err(e) = self.seal_output() {
            error!(error = %e, "failed to seal compaction output");
        }
    }

    fn seal_output(&mut self) -> Result<()> {
        if let Some(output) = self.output.take() {
            if output.seal()? {
                self.shared.compaction.queue(&output);
            }
        }
        Ok(())
    }
}
