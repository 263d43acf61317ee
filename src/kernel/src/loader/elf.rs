//! ELF32 header and program header parsing.
//!
//! Fields are decoded from little-endian bytes, so no packed-struct casts
//! are needed.

use core::fmt;
use vireo_common::{LoadError, SegmentFlags};

pub(crate) const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
pub(crate) const ELFCLASS32: u8 = 1;
pub(crate) const ELFDATA2LSB: u8 = 1;
pub(crate) const EV_CURRENT: u8 = 1;
pub(crate) const ET_EXEC: u16 = 2;
pub(crate) const EM_386: u16 = 3;
pub(crate) const PT_LOAD: u32 = 1;
pub(crate) const PT_NOTE: u32 = 4;

/// Size of an ELF32 file header.
pub const EHDR_SIZE: usize = 52;
/// Size of an ELF32 program header.
pub const PHDR_SIZE: usize = 32;

fn u16_at(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn u32_at(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// The ELF32 file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfHeader {
    /// Identification bytes (`e_ident`).
    pub ident: [u8; 16],
    /// Object file type.
    pub kind: u16,
    /// Target machine.
    pub machine: u16,
    /// Object file version.
    pub version: u32,
    /// Entry point virtual address.
    pub entry: u32,
    /// File offset of the program header table.
    pub phoff: u32,
    /// Header size recorded by the linker.
    pub ehsize: u16,
    /// Size of one program header.
    pub phentsize: u16,
    /// Number of program headers.
    pub phnum: u16,
}

impl ElfHeader {
    /// Decodes a header without validating it.
    pub fn parse(bytes: &[u8; EHDR_SIZE]) -> Self {
        let mut ident = [0u8; 16];
        ident.copy_from_slice(&bytes[..16]);
        ElfHeader {
            ident,
            kind: u16_at(bytes, 16),
            machine: u16_at(bytes, 18),
            version: u32_at(bytes, 20),
            entry: u32_at(bytes, 24),
            phoff: u32_at(bytes, 28),
            ehsize: u16_at(bytes, 40),
            phentsize: u16_at(bytes, 42),
            phnum: u16_at(bytes, 44),
        }
    }

    /// Checks that this is a static little-endian i386 ELF32 executable
    /// whose recorded sizes match what this loader decodes.
    pub fn validate(&self) -> Result<(), LoadError> {
        if self.ident[..4] != ELF_MAGIC {
            return Err(LoadError::BadMagic);
        }
        if self.ident[4] != ELFCLASS32 {
            return Err(LoadError::UnsupportedClass);
        }
        if self.ident[5] != ELFDATA2LSB {
            return Err(LoadError::UnsupportedEncoding);
        }
        if self.ident[6] != EV_CURRENT || self.version != u32::from(EV_CURRENT) {
            return Err(LoadError::UnsupportedVersion);
        }
        if self.ehsize as usize != EHDR_SIZE {
            return Err(LoadError::HeaderSize {
                expected: EHDR_SIZE as u16,
                found: self.ehsize,
            });
        }
        if self.kind != ET_EXEC {
            return Err(LoadError::NotExecutable);
        }
        if self.machine != EM_386 {
            return Err(LoadError::UnsupportedMachine);
        }
        // An empty table may leave phentsize zeroed.
        if self.phnum > 0 && self.phentsize as usize != PHDR_SIZE {
            return Err(LoadError::ProgramHeaderSize {
                expected: PHDR_SIZE as u16,
                found: self.phentsize,
            });
        }
        Ok(())
    }
}

impl fmt::Display for ElfHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "magic:")?;
        for byte in &self.ident {
            write!(f, " {:02x}", byte)?;
        }
        write!(
            f,
            " type={} machine={} entry={:#x} ehsize={} phoff={} phentsize={} phnum={}",
            self.kind, self.machine, self.entry, self.ehsize, self.phoff, self.phentsize, self.phnum
        )
    }
}

/// One ELF32 program header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    /// Segment type.
    pub kind: u32,
    /// Offset of the segment's data in the file.
    pub offset: u32,
    /// Virtual address of the segment's first byte.
    pub vaddr: u32,
    /// Bytes of data stored in the file.
    pub filesz: u32,
    /// Bytes the segment occupies in memory.
    pub memsz: u32,
    /// Declared permissions.
    pub flags: SegmentFlags,
    /// Declared alignment.
    pub align: u32,
}

impl ProgramHeader {
    /// Decodes one entry of the program header table.
    pub fn parse(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= PHDR_SIZE);
        ProgramHeader {
            kind: u32_at(bytes, 0),
            offset: u32_at(bytes, 4),
            vaddr: u32_at(bytes, 8),
            // p_paddr at 12 is meaningless for user images.
            filesz: u32_at(bytes, 16),
            memsz: u32_at(bytes, 20),
            flags: SegmentFlags::from_bits_truncate(u32_at(bytes, 24)),
            align: u32_at(bytes, 28),
        }
    }

    /// Whether this segment is mapped at load time.
    pub fn is_load(&self) -> bool {
        self.kind == PT_LOAD
    }
}
