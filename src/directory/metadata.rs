//! Superblock persistence
//!
//! `METADATA` is never modified in place: the new contents go to
//! `METADATA.tmp`, which is synced and renamed over the original, and then
//! the directory is synced.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::codec::Superblock;
use crate::error::{DriftError, Result};

use super::sync_dir;

pub const METADATA_FILE_NAME: &str = "METADATA";
const METADATA_TMP_FILE_NAME: &str = "METADATA.tmp";

#[derive(Debug, Clone)]
pub struct DbMetadata {
    dir: PathBuf,
    superblock: Superblock,
}

impl DbMetadata {
    /// Load the superblock, or a default one for a fresh directory
    pub fn load(dir: &Path) -> Result<Self> {
        let superblock = match fs::read(dir.join(METADATA_FILE_NAME)) {
            Ok(bytes) => Superblock::deserialize(&bytes).map_err(|e| {
                DriftError::Structural(format!("unreadable {}: {}", METADATA_FILE_NAME, e))
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Superblock::default(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            superblock,
        })
    }

    pub fn superblock(&self) -> Superblock {
        self.superblock
    }

    pub fn is_open(&self) -> bool {
        self.superblock.open
    }

    pub fn io_error(&self) -> bool {
        self.superblock.io_error
    }

    pub fn max_file_size(&self) -> u32 {
        self.superblock.max_file_size
    }

    pub fn set_open(&mut self, open: bool) {
        self.superblock.open = open;
    }

    pub fn set_io_error(&mut self, io_error: bool) {
        self.superblock.io_error = io_error;
    }

    pub fn set_max_file_size(&mut self, size: u32) {
        self.superblock.max_file_size = size;
    }

    /// Atomically replace `METADATA` with the current superblock
    pub fn save(&self) -> Result<()> {
        let tmp = self.dir.join(METADATA_TMP_FILE_NAME);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&self.superblock.serialize())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(METADATA_FILE_NAME))?;
        sync_dir(&self.dir)?;
        Ok(())
    }
}
