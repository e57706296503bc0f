//! Data record
//!
//! The unit appended to data segments: header, key, value.

use bytes::{Buf, BufMut, BytesMut};

use super::{check, checksum, CodecError, Entry, DATA_FILE_VERSION};

/// A key-value pair as stored in a data segment. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub version: u8,
    pub sequence_number: i64,
    pub checksum: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Record {
    /// version(1) + key_size(1) + value_size(4) + sequence_number(8) + checksum(4)
    pub const HEADER_SIZE: usize = 1 + 1 + 4 + 8 + 4;
    const HEADER_SIZE_WITHOUT_CHECKSUM: usize = Self::HEADER_SIZE - 4;

    /// Build a record and seal it with its checksum.
    ///
    /// Keys are limited to 255 bytes by the format; callers validate first.
    pub fn new(key: Vec<u8>, value: Vec<u8>, sequence_number: i64) -> Self {
        let mut record = Self {
            version: DATA_FILE_VERSION,
            sequence_number,
            checksum: 0,
            key,
            value,
        };
        record.checksum = record.compute_checksum();
        record
    }

    pub fn key_size(&self) -> u8 {
        self.key.len() as u8
    }

    pub fn value_size(&self) -> u32 {
        self.value.len() as u32
    }

    /// Serialized size of a record with the given key and value lengths
    pub fn size_of(key_len: usize, value_len: usize) -> usize {
        Self::HEADER_SIZE + key_len + value_len
    }

    /// Offset of the value bytes for a record written at `record_offset`
    pub fn value_offset(record_offset: u32, key_len: usize) -> u32 {
        record_offset + (Self::HEADER_SIZE + key_len) as u32
    }

    fn header_without_checksum(&self) -> [u8; Self::HEADER_SIZE_WITHOUT_CHECKSUM] {
        let mut header = [0u8; Self::HEADER_SIZE_WITHOUT_CHECKSUM];
        let mut buf = &mut header[..];
        buf.put_u8(self.version);
        buf.put_u8(self.key_size());
        buf.put_u32(self.value_size());
        buf.put_i64(self.sequence_number);
        header
    }

    fn compute_checksum(&self) -> u32 {
        checksum(&[&self.header_without_checksum(), &self.key, &self.value])
    }
}

impl Entry for Record {
    const HEADER_SIZE: usize = Record::HEADER_SIZE;

    fn body_len(header: &[u8]) -> usize {
        let mut h = header;
        h.advance(1);
        let key_size = h.get_u8() as usize;
        let value_size = h.get_u32() as usize;
        key_size + value_size
    }

    fn decode(header: &[u8], body: &[u8]) -> Result<Self, CodecError> {
        let mut h = header;
        let version = h.get_u8();
        let key_size = h.get_u8() as usize;
        let value_size = h.get_u32() as usize;
        let sequence_number = h.get_i64();
        let stored = h.get_u32();

        super::ensure_len(body, key_size + value_size)?;
        let (key, value) = body.split_at(key_size);

        let record = Self {
            version,
            sequence_number,
            checksum: stored,
            key: key.to_vec(),
            value: value[..value_size].to_vec(),
        };
        check(stored, record.compute_checksum())?;
        Ok(record)
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.serialized_size());
        buf.put_slice(&self.header_without_checksum());
        buf.put_u32(self.checksum);
        buf.put_slice(&self.key);
        buf.put_slice(&self.value);
    }

    fn serialized_size(&self) -> usize {
        Self::size_of(self.key.len(), self.value.len())
    }

    fn verify_checksum(&self) -> bool {
        self.checksum == self.compute_checksum()
    }
}
