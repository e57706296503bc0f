//! Tombstone file entry

use bytes::{Buf, BufMut, BytesMut};

use super::{check, checksum, CodecError, Entry, TOMBSTONE_FILE_VERSION};

/// A logged deletion of `key` at `sequence_number`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TombstoneFileEntry {
    pub version: u8,
    pub sequence_number: i64,
    pub checksum: u32,
    pub key: Vec<u8>,
}

impl TombstoneFileEntry {
    /// version(1) + key_size(1) + sequence_number(8) + checksum(4)
    pub const HEADER_SIZE: usize = 1 + 1 + 8 + 4;
    const HEADER_SIZE_WITHOUT_CHECKSUM: usize = Self::HEADER_SIZE - 4;

    pub fn new(key: Vec<u8>, sequence_number: i64) -> Self {
        let mut entry = Self {
            version: TOMBSTONE_FILE_VERSION,
            sequence_number,
            checksum: 0,
            key,
        };
        entry.checksum = entry.compute_checksum();
        entry
    }

    pub fn key_size(&self) -> u8 {
        self.key.len() as u8
    }

    fn header_without_checksum(&self) -> [u8; Self::HEADER_SIZE_WITHOUT_CHECKSUM] {
        let mut header = [0u8; Self::HEADER_SIZE_WITHOUT_CHECKSUM];
        let mut buf = &mut header[..];
        buf.put_u8(self.version);
        buf.put_u8(self.key_size());
        buf.put_i64(self.sequence_number);
        header
    }

    fn compute_checksum(&self) -> u32 {
        checksum(&[&self.header_without_checksum(), &self.key])
    }
}

impl Entry for TombstoneFileEntry {
    const HEADER_SIZE: usize = TombstoneFileEntry::HEADER_SIZE;

    fn body_len(header: &[u8]) -> usize {
        header[1] as usize
    }

    fn decode(header: &[u8], body: &[u8]) -> Result<Self, CodecError> {
        let mut h = header;
        let version = h.get_u8();
        let key_size = h.get_u8() as usize;
        let sequence_number = h.get_i64();
        let stored = h.get_u32();

        super::ensure_len(body, key_size)?;
        let entry = Self {
            version,
            sequence_number,
            checksum: stored,
            key: body[..key_size].to_vec(),
        };
        check(stored, entry.compute_checksum())?;
        Ok(entry)
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.serialized_size());
        buf.put_slice(&self.header_without_checksum());
        buf.put_u32(self.checksum);
        buf.put_slice(&self.key);
    }

    fn serialized_size(&self) -> usize {
        Self::HEADER_SIZE + self.key.len()
    }

    fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}
