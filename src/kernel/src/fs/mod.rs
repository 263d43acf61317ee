//! In-memory root filesystem holding program images.

use core::fmt;
use lazy_static::lazy_static;

pub mod ramfs;

pub use ramfs::{RamFile, RamFs};

/// Error type for filesystem operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No file at the given path.
    NotFound,
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => f.write_str("file not found"),
        }
    }
}

lazy_static! {
    /// The root filesystem.
    pub static ref ROOT_FS: RamFs = RamFs::new();
}
