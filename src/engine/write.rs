//! Write path
//!
//! Every mutation runs with the writer lock held:
//!
//! ```text
//! check precondition ─► next seq ─► append (roll over if full) ─► publish
//!                                                                   │
//!          seal + queue if the open segment went stale ◄─ credit stale
//! ```

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::debug;

use crate::codec::{Entry, Record, TombstoneFileEntry};
use crate::command::{ModifyResult, RecordExistsAction, SequenceNumberPolicy, WriteOp, WritePolicy};
use crate::directory::sync_dir;
use crate::error::{DriftError, Result};
use crate::index::IndexMetadata;
use crate::segment::{DataFile, TombstoneFile};

use super::{Engine, Shared};

/// Everything only the writer touches
pub(crate) struct WriterState {
    pub(super) next_sequence_number: i64,
    current_data: Option<Arc<DataFile>>,
    current_tombstone: Option<TombstoneFile>,
}

impl WriterState {
    pub(super) fn new(next_sequence_number: i64) -> Self {
        Self {
            next_sequence_number,
            current_data: None,
            current_tombstone: None,
        }
    }

    /// Never hands out `i64::MIN`
    fn next_sequence_number(&mut self) -> i64 {
        let sequence_number = self.next_sequence_number;
        self.next_sequence_number = match sequence_number.wrapping_add(1) {
            i64::MIN => i64::MIN + 1,
            next => next,
        };
        sequence_number
    }

    /// Seal the open segments at shutdown
    pub(super) fn close(&mut self) -> Result<()> {
        if let Some(file) = self.current_data.take() {
            file.seal()?;
        }
        if let Some(tombstone) = self.current_tombstone.take() {
            tombstone.flush_to_disk()?;
        }
        Ok(())
    }
}

impl Engine {
    // =========================================================================
    // Public mutations
    // =========================================================================

    /// Insert or overwrite
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<ModifyResult> {
        self.validate(key, value)?;
        self.mutate(|writer| {
            let existing = self.shared.index.get(key);
            self.write_value(writer, key, value, existing)
        })
    }

    /// Insert only if the key is absent; otherwise report its sequence number
    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<ModifyResult> {
        self.validate(key, value)?;
        self.mutate(|writer| match self.shared.index.get(key) {
            Some(existing) => Ok(ModifyResult::rejected(existing.sequence_number)),
            None => self.write_value(writer, key, value, None),
        })
    }

    /// Overwrite only if the key is present
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<ModifyResult> {
        self.validate(key, value)?;
        self.mutate(|writer| match self.shared.index.get(key) {
            None => Ok(ModifyResult::failed()),
            Some(existing) => self.write_value(writer, key, value, Some(existing)),
        })
    }

    /// Overwrite only if the key's current sequence number is `sequence_number`
    pub fn replace_with_sequence_number_equals(
        &self,
        key: &[u8],
        value: &[u8],
        sequence_number: i64,
    ) -> Result<ModifyResult> {
        self.validate(key, value)?;
        self.mutate(|writer| match self.shared.index.get(key) {
            None => Ok(ModifyResult::failed()),
            Some(existing) if existing.sequence_number != sequence_number => {
                Ok(ModifyResult::rejected(existing.sequence_number))
            }
            Some(existing) => self.write_value(writer, key, value, Some(existing)),
        })
    }

    /// Remove the key, logging a tombstone
    pub fn delete(&self, key: &[u8]) -> Result<ModifyResult> {
        self.validate_key(key)?;
        self.mutate(|writer| match self.shared.index.get(key) {
            None => Ok(ModifyResult::failed()),
            Some(_) => self.write_tombstone(writer, key),
        })
    }

    /// Remove the key only if its current sequence number is `sequence_number`
    pub fn delete_with_sequence_number_equals(&self, key: &[u8], sequence_number: i64) -> Result<ModifyResult> {
        self.validate_key(key)?;
        self.mutate(|writer| match self.shared.index.get(key) {
            Some(existing) if existing.sequence_number == sequence_number => {
                self.write_tombstone(writer, key)
            }
            _ => Ok(ModifyResult::failed()),
        })
    }

    /// Dispatch a mutation described by `op` and `policy`.
    ///
    /// `value` is ignored for deletes. Combinations outside the table on
    /// [`WritePolicy`] are rejected with `InvalidArgument`.
    pub fn write(&self, op: WriteOp, policy: &WritePolicy, key: &[u8], value: &[u8]) -> Result<ModifyResult> {
        use RecordExistsAction as Exists;
        use SequenceNumberPolicy as Seq;

        match (op, policy.sequence_number_policy, policy.record_exists_action) {
            (WriteOp::Put, Seq::None, Exists::None) => self.put(key, value),
            (WriteOp::Put, Seq::None, Exists::CreateOnly) => self.put_if_absent(key, value),
            (WriteOp::Put, Seq::None, Exists::ReplaceOnly) => self.replace(key, value),
            (WriteOp::Put, Seq::ExpectEqual(seq), Exists::ReplaceOnly) => {
                self.replace_with_sequence_number_equals(key, value, seq)
            }
            (WriteOp::Delete, Seq::None, Exists::None) => self.delete(key),
            (WriteOp::Delete, Seq::ExpectEqual(seq), Exists::None) => {
                self.delete_with_sequence_number_equals(key, seq)
            }
            (op, seq, exists) => Err(DriftError::InvalidArgument(format!(
                "unsupported write policy: {:?} with {:?} and {:?}",
                op, seq, exists
            ))),
        }
    }

    // =========================================================================
    // Writer region
    // =========================================================================

    /// Run `op` inside the single-writer region.
    ///
    /// An I/O failure is persisted in the superblock. After a successful
    /// mutation an open segment flagged as stale is sealed and queued.
    fn mutate<F>(&self, op: F) -> Result<ModifyResult>
    where
        F: FnOnce(&mut WriterState) -> Result<ModifyResult>,
    {
        let mut writer = self.writer.lock();
        if self.shared.is_closed() {
            return Err(DriftError::Closed);
        }

        let result = op(&mut *writer).and_then(|result| {
            self.seal_if_flagged(&mut *writer)?;
            Ok(result)
        });
        if let Err(DriftError::Io(e)) = &result {
            self.shared.record_io_error(e);
        }
        result
    }

    fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > self.shared.config.max_key_size {
            return Err(DriftError::InvalidArgument(format!(
                "key is {} bytes, limit is {}",
                key.len(),
                self.shared.config.max_key_size
            )));
        }
        Ok(())
    }

    fn validate(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.validate_key(key)?;
        let size = Record::size_of(key.len(), value.len());
        if size > self.shared.config.max_file_size as usize {
            return Err(DriftError::InvalidArgument(format!(
                "record is {} bytes, max_file_size is {}",
                size, self.shared.config.max_file_size
            )));
        }
        Ok(())
    }

    /// Append a record and make it the key's current version.
    /// `existing` is what the caller observed in the index.
    fn write_value(
        &self,
        writer: &mut WriterState,
        key: &[u8],
        value: &[u8],
        existing: Option<IndexMetadata>,
    ) -> Result<ModifyResult> {
        let sequence_number = writer.next_sequence_number();
        let record = Record::new(key.to_vec(), value.to_vec(), sequence_number);
        let location = self.append_record(writer, &record)?;

        if let Some(previous) = publish(&self.shared, key, existing, location) {
            self.shared
                .mark_stale(previous.file_id, previous.record_size(key.len()));
        }
        Ok(ModifyResult::applied(sequence_number))
    }

    /// Log a tombstone and remove the key from the index
    fn write_tombstone(&self, writer: &mut WriterState, key: &[u8]) -> Result<ModifyResult> {
        let sequence_number = writer.next_sequence_number();
        let entry = TombstoneFileEntry::new(key.to_vec(), sequence_number);
        let tombstone_id = self.append_tombstone(writer, &entry)?;

        if let Some(removed) = self.shared.index.delete(key) {
            self.shared
                .mark_stale(removed.file_id, removed.record_size(key.len()));
        }
        // After the delete: any segment the compactor could still have
        // copied the record into is already in the data file map
        self.shared.associate_tombstone(tombstone_id);
        Ok(ModifyResult::applied(sequence_number))
    }

    // =========================================================================
    // Segments
    // =========================================================================

    fn append_record(&self, writer: &mut WriterState, record: &Record) -> Result<IndexMetadata> {
        let size = record.serialized_size() as u64;
        let max_file_size = self.shared.config.max_file_size as u64;

        let file = match &writer.current_data {
            Some(file) if file.write_offset() as u64 + size <= max_file_size => Arc::clone(file),
            _ => self.roll_data_file(writer)?,
        };
        file.write_record(record)
    }

    /// Seal the open segment (queueing it if it was flagged) and open a new one
    fn roll_data_file(&self, writer: &mut WriterState) -> Result<Arc<DataFile>> {
        if let Some(full) = writer.current_data.take() {
            self.seal(&full)?;
        }
        let file = self.shared.create_data_file(false)?;
        debug!(file_id = file.id(), "rolled over data file");
        writer.current_data = Some(Arc::clone(&file));
        Ok(file)
    }

    fn seal(&self, file: &Arc<DataFile>) -> Result<()> {
        if file.seal()? {
            self.shared.compaction.queue(file);
        }
        Ok(())
    }

    /// Seal the open segment early if it crossed the compaction threshold.
    /// A segment filled below `compaction_threshold × max_file_size` keeps
    /// taking writes until it reaches that fill or rolls over.
    fn seal_if_flagged(&self, writer: &mut WriterState) -> Result<()> {
        let config = &self.shared.config;
        let min_fill = config.compaction_threshold * config.max_file_size as f64;
        let flagged = matches!(
            &writer.current_data,
            Some(file) if file.compaction_requested() && file.write_offset() as f64 >= min_fill
        );
        if flagged {
            if let Some(file) = writer.current_data.take() {
                debug!(file_id = file.id(), "sealing stale open segment");
                self.seal(&file)?;
            }
        }
        Ok(())
    }

    /// Returns the id of the tombstone file written to
    fn append_tombstone(&self, writer: &mut WriterState, entry: &TombstoneFileEntry) -> Result<u32> {
        let size = entry.serialized_size() as u64;
        let max_size = self.shared.config.max_tombstone_file_size as u64;

        let fits = matches!(
            &writer.current_tombstone,
            Some(file) if file.write_offset() + size <= max_size
        );
        if !fits {
            if let Some(full) = writer.current_tombstone.take() {
                full.flush_to_disk()?;
            }
            let dir = self.shared.dir.clone();
            let threshold = self.shared.config.data_flush_threshold;
            let file = self
                .shared
                .create_with_fresh_id(|id| Ok(TombstoneFile::create(&dir, id, threshold)?))?;
            sync_dir(&dir)?;
            self.shared.current_tombstone.store(file.id(), Ordering::SeqCst);
            debug!(file_id = file.id(), "rolled over tombstone file");
            writer.current_tombstone = Some(file);
        }

        match &writer.current_tombstone {
            Some(file) => {
                file.write(entry)?;
                Ok(file.id())
            }
            None => Err(DriftError::Structural("no open tombstone file".into())),
        }
    }
}

/// Install `location` as the key's current entry and return the entry it
/// displaced. Only the compaction worker can race the writer here, and it
/// only relocates, so the loop settles within a retry or two.
fn publish(
    shared: &Shared,
    key: &[u8],
    mut current: Option<IndexMetadata>,
    location: IndexMetadata,
) -> Option<IndexMetadata> {
    loop {
        match current {
            None => match shared.index.put_if_absent(key, location) {
                None => return None,
                Some(present) => current = Some(present),
            },
            Some(previous) => {
                if shared.index.replace(key, &previous, location) {
                    return Some(previous);
                }
                current = shared.index.get(key);
            }
        }
    }
}
