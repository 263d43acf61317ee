//! ELF32 program loader.
//!
//! Turns an executable image into a populated user address space plus the
//! entry point and initial stack pointer the new task starts from.
//!
//! # Guarantees
//!
//! - Every frame is zero-filled before it becomes visible in the target
//!   space, so no stale physical memory leaks into a process.
//! - Segment pages are mapped writable only while their data is copied in;
//!   the declared permission is applied strictly afterwards.
//! - Mappings are only ever added. On failure the partially populated space
//!   is left to the caller to discard.

pub mod elf;
mod image;

pub use image::ElfImageBuilder;

use alloc::vec::Vec;
use vireo_common::LoadError;
use vireo_hal::{AddressSpace, FileIo, FrameAllocator, SeekFrom, VirtAddr, PAGE_SIZE};

use crate::config;
use elf::{ElfHeader, ProgramHeader, EHDR_SIZE, PHDR_SIZE};

/// Where the loader places the user stack and how far segments may reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderConfig {
    /// One past the highest stack byte.
    pub stack_top: VirtAddr,
    /// Stack size in pages.
    pub stack_pages: u64,
    /// Segments must end at or below this address.
    pub user_end: VirtAddr,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        LoaderConfig {
            stack_top: VirtAddr::new(config::USER_SPACE_END),
            stack_pages: config::USER_STACK_PAGES,
            user_end: VirtAddr::new(config::USER_SPACE_END),
        }
    }
}

/// Result of a successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedProgram {
    /// Entry point recorded in the header.
    pub entry: VirtAddr,
    /// Initial stack pointer, aligned to [`config::STACK_ALIGN`].
    pub stack_pointer: VirtAddr,
    /// Number of `PT_LOAD` segments populated.
    pub segments_loaded: usize,
    /// Pages newly mapped, stack included.
    pub pages_mapped: usize,
}

/// Pages covering `[vaddr, vaddr + memsz)`: the first page and the page count.
///
/// A span shorter than a page that straddles a page boundary covers two
/// pages. An empty span covers none.
pub fn page_span(vaddr: VirtAddr, memsz: u64) -> Option<(VirtAddr, u64)> {
    if memsz == 0 {
        return Some((vaddr.page_floor(), 0));
    }
    let last = vaddr.checked_add(memsz - 1)?;
    let first = vaddr.page_floor();
    let count = (last.page_floor().as_u64() - first.as_u64()) / PAGE_SIZE + 1;
    Some((first, count))
}

/// Loads the image read from `file` into `space`.
///
/// `file` must be positioned at the start of the image.
pub fn load_program<F, A, P>(
    file: &mut F,
    space: &mut A,
    frames: &mut P,
    cfg: &LoaderConfig,
) -> Result<LoadedProgram, LoadError>
where
    F: FileIo,
    A: AddressSpace,
    P: FrameAllocator,
{
    let header = read_header(file)?;
    log::trace!("elf header: {}", header);

    let phdrs = read_program_headers(file, &header)?;

    let mut loaded = LoadedProgram {
        entry: VirtAddr::new(u64::from(header.entry)),
        stack_pointer: VirtAddr::new(0),
        segments_loaded: 0,
        pages_mapped: 0,
    };

    for phdr in phdrs.iter().filter(|p| p.is_load()) {
        loaded.pages_mapped += load_segment(file, space, frames, phdr, cfg)?;
        loaded.segments_loaded += 1;
    }
    // The scratch table is released here, before the stack is built.
    drop(phdrs);

    loaded.pages_mapped += map_stack(space, frames, cfg)?;
    loaded.stack_pointer = initial_stack_pointer(cfg)?;

    log::info!(
        "loaded {} segment(s), {} page(s), entry {}, sp {}",
        loaded.segments_loaded,
        loaded.pages_mapped,
        loaded.entry,
        loaded.stack_pointer
    );
    Ok(loaded)
}

fn read_header<F: FileIo>(file: &mut F) -> Result<ElfHeader, LoadError> {
    let mut bytes = [0u8; EHDR_SIZE];
    file.read_exact(&mut bytes).map_err(|err| match err {
        vireo_common::IoError::UnexpectedEof => LoadError::TruncatedHeader,
        other => LoadError::Io(other),
    })?;
    let header = ElfHeader::parse(&bytes);
    header.validate()?;
    Ok(header)
}

/// Reads the whole program header table in one pass.
fn read_program_headers<F: FileIo>(
    file: &mut F,
    header: &ElfHeader,
) -> Result<Vec<ProgramHeader>, LoadError> {
    if header.phnum > config::MAX_PROGRAM_HEADERS {
        return Err(LoadError::TooManySegments);
    }
    let count = usize::from(header.phnum);
    let table_len = count * PHDR_SIZE;

    let mut table = Vec::new();
    table
        .try_reserve_exact(table_len)
        .map_err(|_| LoadError::OutOfMemory)?;
    table.resize(table_len, 0u8);

    seek_to(file, u64::from(header.phoff))?;
    file.read_exact(&mut table)?;

    let mut phdrs = Vec::new();
    phdrs
        .try_reserve_exact(count)
        .map_err(|_| LoadError::OutOfMemory)?;
    phdrs.extend(table.chunks_exact(PHDR_SIZE).map(ProgramHeader::parse));
    Ok(phdrs)
}

fn seek_to<F: FileIo>(file: &mut F, offset: u64) -> Result<(), LoadError> {
    let pos = file.seek(SeekFrom::Start(offset))?;
    if pos != offset {
        return Err(LoadError::Io(vireo_common::IoError::InvalidSeek));
    }
    Ok(())
}

/// Maps, populates and seals one `PT_LOAD` segment. Returns the number of
/// pages it newly mapped.
fn load_segment<F, A, P>(
    file: &mut F,
    space: &mut A,
    frames: &mut P,
    phdr: &ProgramHeader,
    cfg: &LoaderConfig,
) -> Result<usize, LoadError>
where
    F: FileIo,
    A: AddressSpace,
    P: FrameAllocator,
{
    let vaddr = VirtAddr::new(u64::from(phdr.vaddr));
    let filesz = u64::from(phdr.filesz);
    let memsz = u64::from(phdr.memsz);

    if memsz < filesz {
        return Err(LoadError::SegmentSizes);
    }
    let end = vaddr
        .checked_add(memsz)
        .ok_or(LoadError::SegmentOutOfRange)?;
    if end > cfg.user_end {
        return Err(LoadError::SegmentOutOfRange);
    }
    let (first_page, page_count) =
        page_span(vaddr, memsz).ok_or(LoadError::SegmentOutOfRange)?;

    log::debug!(
        "segment {}..{} filesz={} flags={:?} pages={}",
        vaddr,
        end,
        filesz,
        phdr.flags,
        page_count
    );

    let mut mapped = 0;
    for page in pages(first_page, page_count) {
        // Neighbouring segments may share a boundary page.
        if space.is_mapped(page) {
            continue;
        }
        map_zeroed_page(space, frames, page)?;
        mapped += 1;
    }

    seek_to(file, u64::from(phdr.offset))?;
    copy_to_user(file, space, vaddr, filesz)?;

    let writable = phdr.flags.is_writable();
    for page in pages(first_page, page_count) {
        space.set_page_rw(page, writable)?;
    }
    Ok(mapped)
}

fn pages(first: VirtAddr, count: u64) -> impl Iterator<Item = VirtAddr> {
    (0..count).map(move |i| VirtAddr::new(first.as_u64() + i * PAGE_SIZE))
}

/// Maps a fresh frame read-write at `page` and clears it.
fn map_zeroed_page<A, P>(space: &mut A, frames: &mut P, page: VirtAddr) -> Result<(), LoadError>
where
    A: AddressSpace,
    P: FrameAllocator,
{
    let frame = frames.alloc_frame().ok_or(LoadError::OutOfFrames)?;
    space.map_page(page, frame, true, true)?;
    space
        .page_mut(page)
        .ok_or(LoadError::MapFailed(vireo_common::MapError::NotMapped))?
        .fill(0);
    Ok(())
}

/// Copies exactly `len` file bytes to `vaddr`, page by page.
fn copy_to_user<F, A>(file: &mut F, space: &mut A, vaddr: VirtAddr, len: u64) -> Result<(), LoadError>
where
    F: FileIo,
    A: AddressSpace,
{
    let mut copied = 0u64;
    while copied < len {
        let addr = VirtAddr::new(vaddr.as_u64() + copied);
        let offset = addr.page_offset();
        let chunk = core::cmp::min(PAGE_SIZE - offset, len - copied);

        let page = space
            .page_mut(addr)
            .ok_or(LoadError::MapFailed(vireo_common::MapError::NotMapped))?;
        let start = offset as usize;
        file.read_exact(&mut page[start..start + chunk as usize])
            .map_err(|err| match err {
                vireo_common::IoError::UnexpectedEof => LoadError::ShortRead,
                other => LoadError::Io(other),
            })?;
        copied += chunk;
    }
    Ok(())
}

/// Maps the user stack directly below `cfg.stack_top`.
fn map_stack<A, P>(space: &mut A, frames: &mut P, cfg: &LoaderConfig) -> Result<usize, LoadError>
where
    A: AddressSpace,
    P: FrameAllocator,
{
    let size = cfg
        .stack_pages
        .checked_mul(PAGE_SIZE)
        .ok_or(LoadError::SegmentOutOfRange)?;
    let bottom = cfg
        .stack_top
        .checked_sub(size)
        .ok_or(LoadError::SegmentOutOfRange)?;

    // An unaligned top makes the stack straddle one more page.
    let (first, count) = page_span(bottom, size).ok_or(LoadError::SegmentOutOfRange)?;
    for page in pages(first, count) {
        map_zeroed_page(space, frames, page)?;
    }
    Ok(count as usize)
}

fn initial_stack_pointer(cfg: &LoaderConfig) -> Result<VirtAddr, LoadError> {
    cfg.stack_top
        .checked_sub(1)
        .map(|top| top.align_down(config::STACK_ALIGN))
        .ok_or(LoadError::SegmentOutOfRange)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MemFile, SimAddressSpace, SimFrames};
    use vireo_common::SegmentFlags;

    const RX: SegmentFlags = SegmentFlags::READ.union(SegmentFlags::EXECUTE);
    const RW: SegmentFlags = SegmentFlags::READ.union(SegmentFlags::WRITE);

    fn load(image: &[u8]) -> (Result<LoadedProgram, LoadError>, SimAddressSpace) {
        let mut file = MemFile::new(image.to_vec());
        let mut space = SimAddressSpace::new();
        let mut frames = SimFrames::new();
        let cfg = LoaderConfig::default();
        let result = load_program(&mut file, &mut space, &mut frames, &cfg);
        (result, space)
    }

    #[test]
    fn test_page_span_aligned_page() {
        assert_eq!(
            page_span(VirtAddr::new(0x1000), 0x1000),
            Some((VirtAddr::new(0x1000), 1))
        );
    }

    #[test]
    fn test_page_span_small_segment_crossing_boundary() {
        // 0x20 bytes starting 0x10 before a page boundary.
        assert_eq!(
            page_span(VirtAddr::new(0x1FF0), 0x20),
            Some((VirtAddr::new(0x1000), 2))
        );
    }

    #[test]
    fn test_page_span_empty() {
        assert_eq!(page_span(VirtAddr::new(0x1234), 0).map(|s| s.1), Some(0));
    }

    #[test]
    fn test_page_span_overflow() {
        assert_eq!(page_span(VirtAddr::new(u64::MAX), 2), None);
    }

    #[test]
    fn test_entry_and_stack_pointer() {
        let image = ElfImageBuilder::new(0x0804_8010)
            .segment(0x0804_8000, RX, &[0xC3; 32], 32)
            .build();
        let (result, _) = load(&image);
        let loaded = result.expect("load failed");

        assert_eq!(loaded.entry, VirtAddr::new(0x0804_8010));
        assert_eq!(loaded.stack_pointer, VirtAddr::new(0xBFFF_FFF0));
        assert_eq!(loaded.segments_loaded, 1);
        assert_eq!(loaded.pages_mapped, 1 + config::USER_STACK_PAGES as usize);
    }

    #[test]
    fn test_stack_pages_zeroed_and_writable() {
        let image = ElfImageBuilder::new(0x1000).build();
        let (result, space) = load(&image);
        result.expect("load failed");

        let top = config::USER_SPACE_END;
        let bottom = top - config::USER_STACK_PAGES * PAGE_SIZE;
        for page in (bottom..top).step_by(PAGE_SIZE as usize) {
            assert_eq!(space.is_writable(VirtAddr::new(page)), Some(true));
            assert!(space.read(VirtAddr::new(page), PAGE_SIZE as usize).iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn test_non_load_segments_skipped() {
        let image = ElfImageBuilder::new(0x1000)
            .note(0x0900_0000, &[1, 2, 3, 4])
            .build();
        let (result, space) = load(&image);
        let loaded = result.expect("load failed");

        assert_eq!(loaded.segments_loaded, 0);
        assert!(!space.is_mapped(VirtAddr::new(0x0900_0000)));
    }

    #[test]
    fn test_memsz_below_filesz_rejected() {
        let image = ElfImageBuilder::new(0x1000)
            .segment(0x0804_8000, RW, &[7; 64], 16)
            .build();
        assert_eq!(load(&image).0, Err(LoadError::SegmentSizes));
    }

    #[test]
    fn test_segment_in_kernel_space_rejected() {
        let image = ElfImageBuilder::new(0x1000)
            .segment(0xC000_0000, RW, &[7; 16], 16)
            .build();
        assert_eq!(load(&image).0, Err(LoadError::SegmentOutOfRange));
    }

    #[test]
    fn test_truncated_header() {
        let image = ElfImageBuilder::new(0x1000).build();
        assert_eq!(load(&image[..20]).0, Err(LoadError::TruncatedHeader));
    }

    #[test]
    fn test_truncated_segment_data() {
        let mut image = ElfImageBuilder::new(0x1000)
            .segment(0x0804_8000, RX, &[0x90; 256], 256)
            .build();
        image.truncate(image.len() - 100);
        assert_eq!(load(&image).0, Err(LoadError::ShortRead));
    }

    #[test]
    fn test_out_of_frames() {
        let image = ElfImageBuilder::new(0x1000)
            .segment(0x0804_8000, RX, &[0x90; 16], 0x3000)
            .build();
        let mut file = MemFile::new(image);
        let mut space = SimAddressSpace::new();
        let mut frames = SimFrames::with_limit(2);

        let result = load_program(&mut file, &mut space, &mut frames, &LoaderConfig::default());
        assert_eq!(result, Err(LoadError::OutOfFrames));
    }

    #[test]
    fn test_too_many_program_headers() {
        let mut image = ElfImageBuilder::new(0x1000).build();
        image[44..46].copy_from_slice(&(config::MAX_PROGRAM_HEADERS + 1).to_le_bytes());
        assert_eq!(load(&image).0, Err(LoadError::TooManySegments));
    }
}
