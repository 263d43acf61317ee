//! RAM filesystem implementation.

use super::FsError;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::Arc;
use spin::Mutex;
use vireo_common::IoError;
use vireo_hal::{FileIo, SeekFrom};

/// A simple in-memory filesystem.
///
/// File contents are immutable once added; replacing a path does not affect
/// files already opened from it.
pub struct RamFs {
    files: Mutex<BTreeMap<String, Arc<[u8]>>>,
}

impl RamFs {
    /// Create a new empty RAM filesystem.
    pub fn new() -> Self {
        Self {
            files: Mutex::new(BTreeMap::new()),
        }
    }

    /// Add a file to the filesystem, replacing any file at `path`.
    pub fn add_file(&self, path: &str, content: &[u8]) {
        self.files.lock().insert(String::from(path), Arc::from(content));
        log::debug!("ramfs: added {} ({} bytes)", path, content.len());
    }

    /// Opens the file at `path`, positioned at its start.
    pub fn open(&self, path: &str) -> Result<RamFile, FsError> {
        let data = self.files.lock().get(path).cloned().ok_or(FsError::NotFound)?;
        Ok(RamFile { data, pos: 0 })
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.lock().len()
    }

    /// Whether the filesystem holds no files.
    pub fn is_empty(&self) -> bool {
        self.files.lock().is_empty()
    }
}

impl Default for RamFs {
    fn default() -> Self {
        Self::new()
    }
}

/// An open file on a [`RamFs`].
#[derive(Debug, Clone)]
pub struct RamFile {
    data: Arc<[u8]>,
    pos: u64,
}

impl RamFile {
    /// File size in bytes.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

impl FileIo for RamFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let Ok(start) = usize::try_from(self.pos) else {
            return Ok(0);
        };
        if start >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64, IoError> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
        };
        self.pos = target.ok_or(IoError::InvalidSeek)?;
        Ok(self.pos)
    }
}
