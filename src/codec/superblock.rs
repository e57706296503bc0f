//! Superblock encoding
//!
//! Fixed 11-byte layout; persistence lives in `directory::metadata`.

use bytes::{Buf, BufMut};

use super::{check, checksum, ensure_len, CodecError, METADATA_FILE_VERSION};

/// Database-wide flags that survive restarts.
///
/// `open` is set at startup and cleared only by a clean shutdown, which
/// makes it the dirty-shutdown detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub version: u8,
    pub open: bool,
    pub io_error: bool,
    pub max_file_size: u32,
}

impl Default for Superblock {
    fn default() -> Self {
        Self {
            version: METADATA_FILE_VERSION,
            open: false,
            io_error: false,
            max_file_size: 0,
        }
    }
}

impl Superblock {
    /// version(1) + open(1) + io_error(1) + max_file_size(4) + checksum(4)
    pub const SIZE: usize = 1 + 1 + 1 + 4 + 4;
    const SIZE_WITHOUT_CHECKSUM: usize = Self::SIZE - 4;

    /// Whether the previous run ended without a clean close
    pub fn needs_repair(&self) -> bool {
        self.open || self.io_error
    }

    fn body(&self) -> [u8; Self::SIZE_WITHOUT_CHECKSUM] {
        let mut body = [0u8; Self::SIZE_WITHOUT_CHECKSUM];
        let mut buf = &mut body[..];
        buf.put_u8(self.version);
        buf.put_u8(self.open as u8);
        buf.put_u8(self.io_error as u8);
        buf.put_u32(self.max_file_size);
        body
    }

    pub fn serialize(&self) -> [u8; Self::SIZE] {
        let body = self.body();
        let mut out = [0u8; Self::SIZE];
        let mut buf = &mut out[..];
        buf.put_slice(&body);
        buf.put_u32(checksum(&[&body]));
        out
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self, CodecError> {
        ensure_len(bytes, Self::SIZE)?;
        let mut b = bytes;
        let superblock = Self {
            version: b.get_u8(),
            open: b.get_u8() != 0,
            io_error: b.get_u8() != 0,
            max_file_size: b.get_u32(),
        };
        let stored = b.get_u32();
        check(stored, checksum(&[&bytes[..Self::SIZE_WITHOUT_CHECKSUM]]))?;
        Ok(superblock)
    }
}
