//! Writing ELF32 executables.
//!
//! The kernel packs its built-in programs with this; the loader tests use
//! it to synthesise images.

use alloc::vec::Vec;
use vireo_common::SegmentFlags;
use vireo_hal::PAGE_SIZE;

use super::elf::{
    EHDR_SIZE, ELFCLASS32, ELFDATA2LSB, ELF_MAGIC, EM_386, ET_EXEC, EV_CURRENT, PHDR_SIZE,
    PT_LOAD, PT_NOTE,
};

/// Size of an ELF32 section header, recorded even though none are written.
const SHDR_SIZE: u16 = 40;

/// Builds little-endian ELF32 i386 executables in memory.
///
/// The program header table directly follows the ELF header; segment data
/// follows the table in the order segments were added.
#[derive(Debug, Clone)]
pub struct ElfImageBuilder {
    entry: u32,
    segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
struct Segment {
    kind: u32,
    vaddr: u32,
    flags: SegmentFlags,
    data: Vec<u8>,
    memsz: u32,
}

impl ElfImageBuilder {
    /// An executable with no segments that starts at `entry`.
    pub fn new(entry: u32) -> Self {
        ElfImageBuilder {
            entry,
            segments: Vec::new(),
        }
    }

    /// Adds a `PT_LOAD` segment with `data` as its file contents.
    pub fn segment(mut self, vaddr: u32, flags: SegmentFlags, data: &[u8], memsz: u32) -> Self {
        self.segments.push(Segment {
            kind: PT_LOAD,
            vaddr,
            flags,
            data: data.to_vec(),
            memsz,
        });
        self
    }

    /// Adds a `PT_NOTE` segment, which the loader skips.
    pub fn note(mut self, vaddr: u32, data: &[u8]) -> Self {
        self.segments.push(Segment {
            kind: PT_NOTE,
            vaddr,
            flags: SegmentFlags::READ,
            data: data.to_vec(),
            memsz: data.len() as u32,
        });
        self
    }

    /// Serializes the image.
    pub fn build(&self) -> Vec<u8> {
        let table_end = EHDR_SIZE + self.segments.len() * PHDR_SIZE;
        let data_len: usize = self.segments.iter().map(|s| s.data.len()).sum();
        let mut image = Vec::with_capacity(table_end + data_len);

        image.extend_from_slice(&ELF_MAGIC);
        image.extend_from_slice(&[ELFCLASS32, ELFDATA2LSB, EV_CURRENT]);
        image.resize(16, 0);
        put_u16(&mut image, ET_EXEC);
        put_u16(&mut image, EM_386);
        put_u32(&mut image, u32::from(EV_CURRENT));
        put_u32(&mut image, self.entry);
        put_u32(&mut image, EHDR_SIZE as u32); // e_phoff
        put_u32(&mut image, 0); // e_shoff
        put_u32(&mut image, 0); // e_flags
        put_u16(&mut image, EHDR_SIZE as u16);
        put_u16(&mut image, PHDR_SIZE as u16);
        put_u16(&mut image, self.segments.len() as u16);
        put_u16(&mut image, SHDR_SIZE);
        put_u16(&mut image, 0); // e_shnum
        put_u16(&mut image, 0); // e_shstrndx

        let mut offset = table_end;
        for seg in &self.segments {
            put_u32(&mut image, seg.kind);
            put_u32(&mut image, offset as u32);
            put_u32(&mut image, seg.vaddr);
            put_u32(&mut image, seg.vaddr); // p_paddr
            put_u32(&mut image, seg.data.len() as u32);
            put_u32(&mut image, seg.memsz);
            put_u32(&mut image, seg.flags.bits());
            put_u32(&mut image, PAGE_SIZE as u32);
            offset += seg.data.len();
        }
        for seg in &self.segments {
            image.extend_from_slice(&seg.data);
        }
        image
    }
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::elf::{ElfHeader, ProgramHeader};

    #[test]
    fn test_data_follows_program_headers() {
        let image = ElfImageBuilder::new(0x1000)
            .segment(0x1000, SegmentFlags::READ, b"abc", 0x10)
            .note(0x2000, b"xy")
            .build();

        assert_eq!(image.len(), EHDR_SIZE + 2 * PHDR_SIZE + 5);
        let second = ProgramHeader::parse(&image[EHDR_SIZE + PHDR_SIZE..]);
        assert!(!second.is_load());
        assert_eq!(second.offset as usize, EHDR_SIZE + 2 * PHDR_SIZE + 3);
        assert_eq!(&image[second.offset as usize..], b"xy");
    }

    #[test]
    fn test_header_passes_validation() {
        let image = ElfImageBuilder::new(0x0804_8000).build();
        let mut bytes = [0u8; EHDR_SIZE];
        bytes.copy_from_slice(&image[..EHDR_SIZE]);
        let header = ElfHeader::parse(&bytes);

        assert_eq!(header.validate(), Ok(()));
        assert_eq!(header.phnum, 0);
        assert_eq!(header.entry, 0x0804_8000);
    }
}
