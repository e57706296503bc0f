//! Configuration for DriftKV
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::codec::TombstoneFileEntry;
use crate::error::{DriftError, Result};

/// Hard upper bound on key length: the on-disk key size field is one byte.
pub const MAX_KEY_SIZE_LIMIT: usize = u8::MAX as usize;

/// Main configuration for a DriftKV instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all segment files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── METADATA          (superblock)
    ///     ├── <id>.data         (data segment)
    ///     ├── <id>.datac        (compaction output segment)
    ///     ├── <id>.index        (side-car index of a data segment)
    ///     └── <id>.tombstone    (tombstone log)
    pub data_dir: PathBuf,

    /// Longest accepted key, in bytes (at most 255)
    pub max_key_size: usize,

    /// Unflushed bytes allowed before a segment forces a data sync
    pub data_flush_threshold: u64,

    /// Data segment size that triggers rollover.
    /// Frozen once the database is created.
    pub max_file_size: u32,

    /// Tombstone segment size that triggers rollover
    pub max_tombstone_file_size: u32,

    // -------------------------------------------------------------------------
    // Recovery Configuration
    // -------------------------------------------------------------------------
    /// Worker threads used to rebuild the index at open
    pub indexing_threads: usize,

    // -------------------------------------------------------------------------
    // Compaction Configuration
    // -------------------------------------------------------------------------
    /// Fraction of a segment that must be stale before it is compacted
    pub compaction_threshold: f64,

    /// How long the compaction worker waits for work before re-checking
    /// whether it has been stopped
    pub compaction_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./driftkv_data"),
            max_key_size: MAX_KEY_SIZE_LIMIT,
            data_flush_threshold: 8 * 1024 * 1024,  // 8 MB
            max_file_size: 32 * 1024 * 1024,        // 32 MB
            max_tombstone_file_size: 8 * 1024 * 1024, // 8 MB
            indexing_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            compaction_threshold: 0.5,
            compaction_poll_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check option ranges
    pub fn validate(&self) -> Result<()> {
        if self.max_key_size == 0 || self.max_key_size > MAX_KEY_SIZE_LIMIT {
            return Err(DriftError::Config(format!(
                "max_key_size must be in 1..={}, got {}",
                MAX_KEY_SIZE_LIMIT, self.max_key_size
            )));
        }
        if self.data_flush_threshold == 0 {
            return Err(DriftError::Config("data_flush_threshold must be > 0".into()));
        }
        if self.max_file_size == 0 {
            return Err(DriftError::Config("max_file_size must be > 0".into()));
        }
        let largest_tombstone = TombstoneFileEntry::HEADER_SIZE + self.max_key_size;
        if (self.max_tombstone_file_size as usize) < largest_tombstone {
            return Err(DriftError::Config(format!(
                "max_tombstone_file_size must hold a tombstone for the longest key ({} bytes)",
                largest_tombstone
            )));
        }
        if self.indexing_threads == 0 {
            return Err(DriftError::Config("indexing_threads must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.compaction_threshold) {
            return Err(DriftError::Config(format!(
                "compaction_threshold must be in [0, 1], got {}",
                self.compaction_threshold
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the maximum key size (in bytes)
    pub fn max_key_size(mut self, size: usize) -> Self {
        self.config.max_key_size = size;
        self
    }

    /// Set the unflushed-bytes threshold
    pub fn data_flush_threshold(mut self, bytes: u64) -> Self {
        self.config.data_flush_threshold = bytes;
        self
    }

    /// Set the data segment rollover size (in bytes)
    pub fn max_file_size(mut self, size: u32) -> Self {
        self.config.max_file_size = size;
        self
    }

    /// Set the tombstone segment rollover size (in bytes)
    pub fn max_tombstone_file_size(mut self, size: u32) -> Self {
        self.config.max_tombstone_file_size = size;
        self
    }

    /// Set the number of recovery worker threads
    pub fn indexing_threads(mut self, count: usize) -> Self {
        self.config.indexing_threads = count;
        self
    }

    /// Set the stale fraction that admits a segment into compaction
    pub fn compaction_threshold(mut self, threshold: f64) -> Self {
        self.config.compaction_threshold = threshold;
        self
    }

    /// Set the compaction worker poll interval
    pub fn compaction_poll_interval(mut self, interval: Duration) -> Self {
        self.config.compaction_poll_interval = interval;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
