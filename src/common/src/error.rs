//! System-wide error types for Vireo.
//!
//! Loader and timer failures are reported to process creation as values.
//! Only broken kernel invariants panic.

use core::fmt;

/// File I/O failures reported by the file collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IoError {
    /// The file ended before the requested bytes were read.
    UnexpectedEof,
    /// Seek target outside the file.
    InvalidSeek,
    /// The backing device failed.
    Device,
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::UnexpectedEof => write!(f, "unexpected end of file"),
            IoError::InvalidSeek => write!(f, "invalid seek"),
            IoError::Device => write!(f, "device error"),
        }
    }
}

/// Paging failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MapError {
    /// The page already has a mapping.
    AlreadyMapped,
    /// The page has no mapping.
    NotMapped,
    /// No frame was available for an intermediate page table.
    PageTableAlloc,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::AlreadyMapped => write!(f, "page already mapped"),
            MapError::NotMapped => write!(f, "page not mapped"),
            MapError::PageTableAlloc => write!(f, "page table allocation failed"),
        }
    }
}

/// Reasons a program image could not be loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// Reading or seeking the image failed.
    Io(IoError),
    /// The image is shorter than an ELF header.
    TruncatedHeader,
    /// The identification bytes are not `\x7fELF`.
    BadMagic,
    /// Not a 32-bit image.
    UnsupportedClass,
    /// Not little endian.
    UnsupportedEncoding,
    /// Unknown ELF version.
    UnsupportedVersion,
    /// Not a static executable (`ET_EXEC`).
    NotExecutable,
    /// Built for another machine.
    UnsupportedMachine,
    /// `e_ehsize` differs from the ELF32 header size.
    HeaderSize {
        /// Size this loader understands.
        expected: u16,
        /// Size recorded in the image.
        found: u16,
    },
    /// `e_phentsize` differs from the ELF32 program header size.
    ProgramHeaderSize {
        /// Size this loader understands.
        expected: u16,
        /// Size recorded in the image.
        found: u16,
    },
    /// More program headers than the loader accepts.
    TooManySegments,
    /// The program header scratch buffer could not be allocated.
    OutOfMemory,
    /// No physical frame was available.
    OutOfFrames,
    /// The address space rejected a mapping or permission change.
    MapFailed(MapError),
    /// A segment declares `p_memsz < p_filesz`.
    SegmentSizes,
    /// A segment reaches outside the user address range.
    SegmentOutOfRange,
    /// The file ended inside a segment's data.
    ShortRead,
}

impl From<IoError> for LoadError {
    fn from(err: IoError) -> Self {
        LoadError::Io(err)
    }
}

impl From<MapError> for LoadError {
    fn from(err: MapError) -> Self {
        LoadError::MapFailed(err)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io(err) => write!(f, "I/O error: {}", err),
            LoadError::TruncatedHeader => write!(f, "truncated ELF header"),
            LoadError::BadMagic => write!(f, "bad ELF magic"),
            LoadError::UnsupportedClass => write!(f, "not an ELF32 image"),
            LoadError::UnsupportedEncoding => write!(f, "not a little-endian image"),
            LoadError::UnsupportedVersion => write!(f, "unsupported ELF version"),
            LoadError::NotExecutable => write!(f, "not a static executable"),
            LoadError::UnsupportedMachine => write!(f, "unsupported machine"),
            LoadError::HeaderSize { expected, found } => {
                write!(f, "ELF header size {} (expected {})", found, expected)
            }
            LoadError::ProgramHeaderSize { expected, found } => {
                write!(f, "program header size {} (expected {})", found, expected)
            }
            LoadError::TooManySegments => write!(f, "too many program headers"),
            LoadError::OutOfMemory => write!(f, "out of kernel memory"),
            LoadError::OutOfFrames => write!(f, "out of physical frames"),
            LoadError::MapFailed(err) => write!(f, "mapping failed: {}", err),
            LoadError::SegmentSizes => write!(f, "segment memory size below file size"),
            LoadError::SegmentOutOfRange => write!(f, "segment outside user space"),
            LoadError::ShortRead => write!(f, "segment data truncated"),
        }
    }
}

/// Timer registry failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerError {
    /// A registration asked for zero ticks.
    ZeroTicks,
    /// Every slot of the fixed-capacity table is taken.
    TableFull,
    /// The idle task asked to sleep.
    IdleTask,
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::ZeroTicks => write!(f, "timer registered for zero ticks"),
            TimerError::TableFull => write!(f, "timer table full"),
            TimerError::IdleTask => write!(f, "the idle task cannot sleep"),
        }
    }
}
