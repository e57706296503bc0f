//! Error types for DriftKV
//!
//! Provides a unified error type for all operations.

use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecError;

/// Result type alias using DriftError
pub type Result<T> = std::result::Result<T, DriftError>;

/// Unified error type for DriftKV operations
#[derive(Debug, Error)]
pub enum DriftError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Integrity Errors
    // -------------------------------------------------------------------------
    /// A record failed checksum verification outside of repair
    #[error("Checksum mismatch in {} at offset {offset}", file.display())]
    Checksum { file: PathBuf, offset: u64 },

    /// A buffer could not be decoded (truncated or checksum mismatch)
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Duplicate file id, missing expected file, undecodable superblock
    #[error("Structural error: {0}")]
    Structural(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Database is closed")]
    Closed,

    /// A recovery worker failed to complete
    #[error("Indexing task failed: {0}")]
    IndexTask(String),
}
