//! Recovery
//!
//! Rebuilds the in-memory state of a database at open.
//!
//! ## Pipeline
//! ```text
//!  1. orphan cleanup       index files without a data file, *.repair leftovers
//!  2. tail repair          (dirty shutdown only) newest .data, newest .datac,
//!                          newest .tombstone; drop *.tombstonec leftovers
//!  3. index build          ┐ one task per index file / tombstone file,
//!  4. tombstone build      ┘ spread over `indexing_threads` workers
//!  5. tombstone merge      survivors rewritten into fresh tombstone files
//! ```
//! Admission of stale-heavy segments into compaction happens after the
//! engine is assembled, once the compaction worker is running.
//!
//! ## Ordering
//! Tasks run in arbitrary order. The sequence number is the only authority
//! on which version of a key is current, so every index update goes through
//! `put_if_absent`/`replace` and retries until it either wins or loses on
//! sequence number.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crossbeam::channel;
use tracing::{debug, info, warn};

use crate::codec::Entry;
use crate::compaction::StaleMap;
use crate::config::Config;
use crate::directory::{sync_dir, DbDirectory};
use crate::error::{DriftError, Result};
use crate::index::{IndexMap, IndexMetadata};
use crate::segment::{segment_path, DataFile, FileKind, TombstoneFile};

/// Summary of a recovery run
#[derive(Debug, Default, Clone)]
pub struct RecoveryResult {
    /// Whether tail repair ran
    pub repaired: bool,

    /// Index entries scanned across all index files
    pub index_entries: u64,

    /// Tombstones that still shadow an on-disk record
    pub tombstones_kept: u64,

    /// Tombstones dropped because they no longer shadow anything
    pub tombstones_dropped: u64,
}

/// Everything the engine needs from recovery
pub(crate) struct Recovered {
    pub data_files: BTreeMap<u32, Arc<DataFile>>,
    pub stale: StaleMap,
    /// tombstone file id -> highest data file id it may shadow
    pub tombstone_last_data: BTreeMap<u32, u32>,
    pub max_file_id: u32,
    /// 0 for a fresh database
    pub max_sequence_number: i64,
    pub result: RecoveryResult,
}

/// Run the recovery pipeline over `directory`, filling `index`
pub(crate) fn recover(
    config: &Config,
    directory: &DbDirectory,
    needs_repair: bool,
    index: &dyn IndexMap,
) -> Result<Recovered> {
    let dir = directory.path();
    let flush_threshold = config.data_flush_threshold;
    let mut result = RecoveryResult::default();
    let mut max_file_id = directory.max_file_id();

    // =========================================================================
    // 1. Orphan cleanup
    // =========================================================================
    remove_orphans(directory)?;

    if directory.is_empty() {
        info!(path = %dir.display(), "fresh database, nothing to recover");
        return Ok(Recovered {
            data_files: BTreeMap::new(),
            stale: StaleMap::default(),
            tombstone_last_data: BTreeMap::new(),
            max_file_id,
            max_sequence_number: 0,
            result,
        });
    }

    // =========================================================================
    // 2. Tail repair
    // =========================================================================
    for &id in directory.compacted_tombstone_files() {
        warn!(file_id = id, "removing leftover compacted tombstone file");
        crate::segment::remove_if_exists(&segment_path(dir, id, FileKind::CompactedTombstone))?;
    }

    let mut opened = BTreeMap::new();
    for (id, compacted) in directory.data_files() {
        if let Some(file) = open_data_file(dir, id, compacted, flush_threshold)? {
            opened.insert(id, file);
        }
    }

    // Only the newest segment of each flavour can have been written to last
    let newest = |want: bool| {
        opened
            .iter()
            .rev()
            .find(|(_, file)| file.is_compacted() == want)
            .map(|(&id, _)| id)
    };
    let tails = [newest(false), newest(true)];

    let mut data_files = BTreeMap::new();
    for (id, file) in opened {
        let file = if needs_repair && tails.contains(&Some(id)) {
            warn!(file_id = id, compacted = file.is_compacted(), "dirty shutdown, repairing data file tail");
            file.repair(flush_threshold)?
        } else {
            file
        };
        data_files.insert(id, Arc::new(file));
    }

    if needs_repair {
        result.repaired = true;
        if let Some(&id) = directory.tombstone_files().last() {
            warn!(file_id = id, "dirty shutdown, repairing tombstone file tail");
            TombstoneFile::open(dir, id, flush_threshold)?.repair(flush_threshold)?;
        }
    }

    // =========================================================================
    // 3. Index build
    // =========================================================================
    let stale = StaleMap::default();
    let files: Vec<Arc<DataFile>> = data_files.values().cloned().collect();
    let built = run_parallel(config.indexing_threads, files, |file| {
        index_data_file(index, &stale, &file)
    })?;

    let mut max_sequence_number = 0i64;
    for (entries, max_seq) in built {
        result.index_entries += entries;
        max_sequence_number = max_sequence_number.max(max_seq);
    }
    info!(
        data_files = data_files.len(),
        entries = result.index_entries,
        keys = index.len(),
        "index built"
    );

    // =========================================================================
    // 4. Tombstone build
    // =========================================================================
    let tombstone_ids = directory.tombstone_files().to_vec();
    let applied = run_parallel(config.indexing_threads, tombstone_ids.clone(), |id| {
        apply_tombstone_file(dir, id, flush_threshold, index, &stale)
    })?;

    for outcome in &applied {
        result.tombstones_kept += outcome.kept;
        result.tombstones_dropped += outcome.dropped;
        max_sequence_number = max_sequence_number.max(outcome.max_sequence_number);
    }
    info!(
        tombstone_files = tombstone_ids.len(),
        kept = result.tombstones_kept,
        dropped = result.tombstones_dropped,
        keys = index.len(),
        "tombstones applied"
    );

    // =========================================================================
    // 5. Tombstone merge
    // =========================================================================
    let max_data_file_id = data_files.keys().next_back().copied().unwrap_or(0);
    let tombstone_ids = if result.tombstones_dropped > 0 {
        merge_tombstone_files(config, dir, &tombstone_ids, &mut max_file_id)?
    } else {
        tombstone_ids
    };
    let tombstone_last_data = tombstone_ids
        .into_iter()
        .map(|id| (id, max_data_file_id))
        .collect();

    Ok(Recovered {
        data_files,
        stale,
        tombstone_last_data,
        max_file_id,
        max_sequence_number,
        result,
    })
}

// =============================================================================
// Steps
// =============================================================================

fn remove_orphans(directory: &DbDirectory) -> Result<()> {
    let dir = directory.path();

    for path in directory.repair_files() {
        warn!(path = %path.display(), "removing leftover repair file");
        crate::segment::remove_if_exists(path)?;
    }

    for &id in directory.index_files() {
        if !directory.has_data_file(id) {
            warn!(file_id = id, "removing index file without a data file");
            crate::segment::remove_if_exists(&segment_path(dir, id, FileKind::Index))?;
        }
    }
    Ok(())
}

/// Open a data file found by the directory scan. A data file whose index
/// file was never created is empty (the index is created right after it);
/// such a file is removed.
fn open_data_file(dir: &Path, id: u32, compacted: bool, flush_threshold: u64) -> Result<Option<DataFile>> {
    if !segment_path(dir, id, FileKind::Index).exists() {
        let path = segment_path(dir, id, FileKind::data(compacted));
        if std::fs::metadata(&path)?.len() == 0 {
            warn!(file_id = id, "removing empty data file without an index file");
            crate::segment::remove_if_exists(&path)?;
            return Ok(None);
        }
        return Err(DriftError::Structural(format!(
            "data file {} has records but no index file",
            id
        )));
    }
    DataFile::open(dir, id, compacted, flush_threshold).map(Some)
}

/// Install every entry of one index file; returns (entries, max sequence)
fn index_data_file(index: &dyn IndexMap, stale: &StaleMap, file: &DataFile) -> Result<(u64, i64)> {
    let mut entries = 0u64;
    let mut max_sequence_number = 0i64;

    for (_, entry) in file.index_file().iter()? {
        entries += 1;
        max_sequence_number = max_sequence_number.max(entry.sequence_number);

        let incoming = IndexMetadata::new(
            file.id(),
            entry.value_offset(),
            entry.value_size(),
            entry.sequence_number,
        );

        let mut current = match index.put_if_absent(&entry.key, incoming) {
            None => continue,
            Some(current) => current,
        };
        loop {
            // Equal sequence numbers are two copies of one record, e.g. a
            // compaction that finished copying but never deleted its source
            if current.sequence_number >= incoming.sequence_number {
                stale.record(file.id(), entry.record_size);
                break;
            }
            if index.replace(&entry.key, &current, incoming) {
                stale.record(current.file_id, current.record_size(entry.key.len()));
                break;
            }
            current = match index.get(&entry.key) {
                Some(current) => current,
                None => match index.put_if_absent(&entry.key, incoming) {
                    None => break,
                    Some(current) => current,
                },
            };
        }
    }

    debug!(file_id = file.id(), entries, "indexed data file");
    Ok((entries, max_sequence_number))
}

struct TombstoneOutcome {
    kept: u64,
    dropped: u64,
    max_sequence_number: i64,
}

/// Apply one tombstone file to the index. Entries that did not remove
/// anything are dropped from the file.
fn apply_tombstone_file(
    dir: &Path,
    id: u32,
    flush_threshold: u64,
    index: &dyn IndexMap,
    stale: &StaleMap,
) -> Result<TombstoneOutcome> {
    let file = TombstoneFile::open(dir, id, flush_threshold)?;
    let mut survivors = Vec::new();
    let mut outcome = TombstoneOutcome {
        kept: 0,
        dropped: 0,
        max_sequence_number: 0,
    };

    for (_, entry) in file.iter()? {
        outcome.max_sequence_number = outcome.max_sequence_number.max(entry.sequence_number);

        let shadows = matches!(
            index.get(&entry.key),
            Some(current) if current.sequence_number < entry.sequence_number
        );
        // Another tombstone task may have removed the key in between
        let removed = if shadows { index.delete(&entry.key) } else { None };
        match removed {
            Some(removed) => {
                stale.record(removed.file_id, removed.record_size(entry.key.len()));
                survivors.push(entry);
            }
            None => outcome.dropped += 1,
        }
    }
    outcome.kept = survivors.len() as u64;

    if outcome.dropped > 0 {
        let rewritten = TombstoneFile::create_compacted(dir, id, flush_threshold)?;
        for entry in &survivors {
            rewritten.write(entry)?;
        }
        drop(file);
        rewritten.promote(flush_threshold)?;
    }

    debug!(
        file_id = id,
        kept = outcome.kept,
        dropped = outcome.dropped,
        "applied tombstone file"
    );
    Ok(outcome)
}

/// Rewrite the surviving tombstones of `ids` into fresh files and delete the
/// old ones; returns the ids of the fresh files.
fn merge_tombstone_files(config: &Config, dir: &Path, ids: &[u32], max_file_id: &mut u32) -> Result<Vec<u32>> {
    let flush_threshold = config.data_flush_threshold;
    let max_size = config.max_tombstone_file_size as u64;
    let mut merged: Vec<TombstoneFile> = Vec::new();
    let mut entries = 0u64;

    for &id in ids {
        let source = TombstoneFile::open(dir, id, flush_threshold)?;
        for (_, entry) in source.iter()? {
            let needs_file = match merged.last() {
                Some(current) => current.write_offset() + entry.serialized_size() as u64 > max_size,
                None => true,
            };
            if needs_file {
                if let Some(full) = merged.last() {
                    full.flush_to_disk()?;
                }
                *max_file_id += 1;
                merged.push(TombstoneFile::create(dir, *max_file_id, flush_threshold)?);
            }
            if let Some(current) = merged.last() {
                current.write(&entry)?;
            }
            entries += 1;
        }
    }

    if let Some(last) = merged.last() {
        last.flush_to_disk()?;
    }
    sync_dir(dir)?;

    for &id in ids {
        crate::segment::remove_if_exists(&segment_path(dir, id, FileKind::Tombstone))?;
    }
    sync_dir(dir)?;

    info!(
        old_files = ids.len(),
        new_files = merged.len(),
        entries,
        "merged tombstone files"
    );
    Ok(merged.iter().map(|f| f.id()).collect())
}

// =============================================================================
// Worker pool
// =============================================================================

/// Run `task` over `items` on up to `threads` scoped workers pulling from a
/// shared channel. The first task error is returned.
fn run_parallel<T, R, F>(threads: usize, items: Vec<T>, task: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Sync,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let workers = threads.clamp(1, items.len());

    let (tx, rx) = channel::unbounded();
    for item in items {
        tx.send(item)
            .map_err(|_| DriftError::IndexTask("work queue closed".into()))?;
    }
    drop(tx);

    let task = &task;
    crossbeam::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let rx = rx.clone();
                scope.spawn(move |_| rx.iter().map(task).collect::<Result<Vec<R>>>())
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            match handle.join() {
                Ok(done) => results.extend(done?),
                Err(_) => return Err(DriftError::IndexTask("recovery worker panicked".into())),
            }
        }
        Ok(results)
    })
    .map_err(|_| DriftError::IndexTask("recovery worker panicked".into()))?
}
