//! Append-only file shared by every segment kind, and the entry iterator.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Take, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::codec::{CodecError, Entry};
use crate::error::{DriftError, Result};

/// An append-only file.
///
/// ## Concurrency:
/// - Appends are serialized by `unflushed` (one appender at a time)
/// - Reads are positional and never block on appends
/// - `write_offset` is stored with Release after the bytes are written, so a
///   reader that observes an offset can read every byte below it
pub(crate) struct SegmentFile {
    path: PathBuf,
    file: File,
    write_offset: AtomicU64,
    /// Bytes appended since the last data sync
    unflushed: Mutex<u64>,
    flush_threshold: u64,
}

impl SegmentFile {
    /// Create a new file; fails with `AlreadyExists` on an id collision
    pub fn create(path: &Path, flush_threshold: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create_new(true)
            .open(path)?;
        Ok(Self::from_file(path, file, 0, flush_threshold))
    }

    /// Create a file, replacing any leftover with the same name
    pub fn create_truncated(path: &Path, flush_threshold: u64) -> io::Result<Self> {
        if path.exists() {
            warn!(path = %path.display(), "replacing leftover file");
            std::fs::remove_file(path)?;
        }
        Self::create(path, flush_threshold)
    }

    /// Open an existing file; the write offset is restored from its size
    pub fn open(path: &Path, writable: bool, flush_threshold: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .append(writable)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self::from_file(path, file, size, flush_threshold))
    }

    fn from_file(path: &Path, file: File, size: u64, flush_threshold: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
            write_offset: AtomicU64::new(size),
            unflushed: Mutex::new(0),
            flush_threshold,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_offset(&self) -> u64 {
        self.write_offset.load(Ordering::Acquire)
    }

    /// Append bytes, returning the offset they were written at
    pub fn append(&self, bytes: &[u8]) -> io::Result<u64> {
        let mut unflushed = self.unflushed.lock();
        let offset = self.write_offset.load(Ordering::Relaxed);

        (&self.file).write_all(bytes)?;

        self.write_offset
            .store(offset + bytes.len() as u64, Ordering::Release);
        self.after_append(&mut unflushed, bytes.len() as u64)?;
        Ok(offset)
    }

    /// Append `len` bytes copied from `src` at `src_offset` without passing
    /// them through user space where the platform allows it.
    pub fn append_from(&self, src: &Path, src_offset: u64, len: u64) -> io::Result<u64> {
        let mut reader = File::open(src)?;
        reader.seek(SeekFrom::Start(src_offset))?;

        let mut unflushed = self.unflushed.lock();
        let offset = self.write_offset.load(Ordering::Relaxed);

        let copied = io::copy(&mut reader.take(len), &mut &self.file)?;
        if copied != len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("copied {} of {} bytes from {}", copied, len, src.display()),
            ));
        }

        self.write_offset.store(offset + len, Ordering::Release);
        self.after_append(&mut unflushed, len)?;
        Ok(offset)
    }

    fn after_append(&self, unflushed: &mut u64, written: u64) -> io::Result<()> {
        *unflushed += written;
        if *unflushed > self.flush_threshold {
            self.file.sync_data()?;
            *unflushed = 0;
        }
        Ok(())
    }

    /// Positional read of exactly `len` bytes
    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        read_exact_at(&self.file, &mut buf, offset)?;
        Ok(buf)
    }

    /// Data-only sync
    pub fn flush(&self) -> io::Result<()> {
        let mut unflushed = self.unflushed.lock();
        self.file.sync_data()?;
        *unflushed = 0;
        Ok(())
    }

    /// Data and metadata sync
    pub fn flush_to_disk(&self) -> io::Result<()> {
        let mut unflushed = self.unflushed.lock();
        self.file.sync_all()?;
        *unflushed = 0;
        Ok(())
    }

    /// Iterate the entries present when the iterator is created
    pub fn iter<E: Entry>(&self) -> Result<EntryIterator<E>> {
        EntryIterator::open(&self.path)
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// =============================================================================
// Entry Iterator
// =============================================================================

/// Forward iterator over the entries of a segment.
///
/// Reads through its own file handle, bounded by the file size at creation.
/// Stops at end-of-file or at the first entry that is truncated or fails its
/// checksum, and never yields an error: callers that need full-file validity
/// check [`EntryIterator::corruption`] afterwards.
pub struct EntryIterator<E> {
    path: PathBuf,
    reader: BufReader<Take<File>>,
    offset: u64,
    end: u64,
    corrupt_at: Option<u64>,
    _entry: PhantomData<E>,
}

impl<E: Entry> EntryIterator<E> {
    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let end = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            reader: BufReader::new(file.take(end)),
            offset: 0,
            end,
            corrupt_at: None,
            _entry: PhantomData,
        })
    }

    /// Offset of the first bad entry, if iteration stopped on one
    pub fn corruption(&self) -> Option<u64> {
        self.corrupt_at
    }

    /// Bytes consumed by the entries yielded so far
    pub fn valid_len(&self) -> u64 {
        self.offset
    }

    fn read_entry(&mut self) -> Result<(E, u64)> {
        let mut header = vec![0u8; E::HEADER_SIZE];
        self.reader.read_exact(&mut header)?;

        // A torn header can declare any length; never allocate past the file
        let body_len = E::body_len(&header);
        let available = self.end.saturating_sub(self.offset + E::HEADER_SIZE as u64);
        if body_len as u64 > available {
            return Err(CodecError::Truncated {
                needed: body_len,
                available: available as usize,
            }
            .into());
        }
        let mut body = vec![0u8; body_len];
        self.reader.read_exact(&mut body)?;

        let entry = E::decode(&header, &body).map_err(DriftError::from)?;
        Ok((entry, (header.len() + body.len()) as u64))
    }
}

impl<E: Entry> Iterator for EntryIterator<E> {
    /// (offset of the entry, entry)
    type Item = (u64, E);

    fn next(&mut self) -> Option<Self::Item> {
        if self.corrupt_at.is_some() || self.offset >= self.end {
            return None;
        }

        let start = self.offset;
        match self.read_entry() {
            Ok((entry, size)) => {
                self.offset += size;
                Some((start, entry))
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    offset = start,
                    error = %e,
                    "stopping iteration at bad entry"
                );
                self.corrupt_at = Some(start);
                None
            }
        }
    }
}
