//! Record Codec Module
//!
//! Byte-exact serialization of everything DriftKV writes to disk.
//!
//! ## Responsibilities
//! - Encode/decode data records, index entries, tombstone entries
//! - Encode/decode the metadata superblock
//! - CRC32 over header-without-checksum + key (+ value)
//!
//! All integers are big-endian.
//!
//! ## Data Record (`<id>.data` / `<id>.datac`)
//! ```text
//! ┌─────────┬─────────┬───────────┬──────────┬──────────┬─────┬───────┐
//! │ Ver (1) │ KLen(1) │ VLen (4)  │ Seq (8)  │ CRC (4)  │ Key │ Value │
//! └─────────┴─────────┴───────────┴──────────┴──────────┴─────┴───────┘
//! ```
//!
//! ## Index Entry (`<id>.index`, one per record, same order)
//! ```text
//! ┌─────────┬─────────┬───────────┬───────────┬──────────┬──────────┬─────┐
//! │ Ver (1) │ KLen(1) │ ROff (4)  │ RSize (4) │ Seq (8)  │ CRC (4)  │ Key │
//! └─────────┴─────────┴───────────┴───────────┴──────────┴──────────┴─────┘
//! ```
//!
//! ## Tombstone Entry (`<id>.tombstone`)
//! ```text
//! ┌─────────┬─────────┬──────────┬──────────┬─────┐
//! │ Ver (1) │ KLen(1) │ Seq (8)  │ CRC (4)  │ Key │
//! └─────────┴─────────┴──────────┴──────────┴─────┘
//! ```
//!
//! ## Superblock (`METADATA`)
//! ```text
//! ┌─────────┬──────────┬─────────────┬──────────────┬──────────┐
//! │ Ver (1) │ Open (1) │ IoError (1) │ MaxFile (4)  │ CRC (4)  │
//! └─────────┴──────────┴─────────────┴──────────────┴──────────┘
//! ```

mod index_entry;
mod record;
mod superblock;
mod tombstone_entry;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

pub use index_entry::IndexFileEntry;
pub use record::Record;
pub use superblock::Superblock;
pub use tombstone_entry::TombstoneFileEntry;

// =============================================================================
// Format Versions
// =============================================================================

pub const DATA_FILE_VERSION: u8 = 0xF1;
pub const INDEX_FILE_VERSION: u8 = 0x34;
pub const TOMBSTONE_FILE_VERSION: u8 = 0x75;
pub const METADATA_FILE_VERSION: u8 = 0x1D;

// =============================================================================
// Codec Errors
// =============================================================================

/// Why a buffer could not be decoded.
///
/// A checksum mismatch is either real corruption or a torn tail; the codec
/// does not tell them apart, callers do by position.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("buffer truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch { stored: u32, computed: u32 },
}

// =============================================================================
// Entry Trait
// =============================================================================

/// An append-only log entry: fixed header followed by a body whose length
/// the header declares.
pub trait Entry: Sized {
    /// Header size, checksum included
    const HEADER_SIZE: usize;

    /// Body length declared by a raw header (`header.len() == HEADER_SIZE`)
    fn body_len(header: &[u8]) -> usize;

    /// Decode and verify a header and its body
    fn decode(header: &[u8], body: &[u8]) -> Result<Self, CodecError>;

    /// Append the serialized form to `buf`
    fn encode_into(&self, buf: &mut BytesMut);

    /// Total bytes this entry occupies on disk
    fn serialized_size(&self) -> usize;

    /// Recompute the checksum and compare with the stored one
    fn verify_checksum(&self) -> bool;

    fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_size());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        ensure_len(bytes, Self::HEADER_SIZE)?;
        let (header, rest) = bytes.split_at(Self::HEADER_SIZE);
        let body_len = Self::body_len(header);
        ensure_len(rest, body_len)?;
        Self::decode(header, &rest[..body_len])
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

pub(crate) fn ensure_len(bytes: &[u8], needed: usize) -> Result<(), CodecError> {
    if bytes.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            available: bytes.len(),
        });
    }
    Ok(())
}

/// CRC32 over the given parts, in order
pub(crate) fn checksum(parts: &[&[u8]]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize()
}

pub(crate) fn check(stored: u32, computed: u32) -> Result<(), CodecError> {
    if stored != computed {
        return Err(CodecError::ChecksumMismatch { stored, computed });
    }
    Ok(())
}
