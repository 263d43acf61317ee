//! Paging and physical frame management.
//!
//! The bootloader maps all physical memory at a fixed offset; page tables
//! and frames are reached through that window. [`ActiveSpace`] exposes the
//! active page table through [`vireo_hal::AddressSpace`] to the loader, for
//! user pages, and to the heap setup, for kernel pages.

use bootloader::bootinfo::{MemoryMap, MemoryRegionType};
use spin::Mutex;
use vireo_common::MapError;
use vireo_hal::{AddressSpace, PAGE_SIZE};
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::mapper::{FlagUpdateError, MapToError, TranslateResult};
use x86_64::structures::paging::{
    FrameAllocator, Mapper, OffsetPageTable, Page, PageTable, PageTableFlags, PhysFrame, Size4KiB,
    Translate,
};
use x86_64::{PhysAddr, VirtAddr};

/// Initializes an `OffsetPageTable` over the active level 4 table.
///
/// # Safety
///
/// All physical memory must be mapped at `physical_memory_offset`, and this
/// must be called only once to avoid aliasing `&mut` references.
pub unsafe fn init_mapper(physical_memory_offset: VirtAddr) -> OffsetPageTable<'static> {
    let (level_4_frame, _) = Cr3::read();
    let virt = physical_memory_offset + level_4_frame.start_address().as_u64();
    let table: *mut PageTable = virt.as_mut_ptr();
    // SAFETY: guaranteed by the caller.
    unsafe { OffsetPageTable::new(&mut *table, physical_memory_offset) }
}

/// Hands out the usable frames of the bootloader's memory map in order.
pub struct BootInfoFrameAllocator {
    memory_map: &'static MemoryMap,
    next: usize,
}

impl BootInfoFrameAllocator {
    /// Creates an allocator over `memory_map`.
    ///
    /// # Safety
    ///
    /// Every frame marked `Usable` in `memory_map` must really be unused.
    pub unsafe fn init(memory_map: &'static MemoryMap) -> Self {
        BootInfoFrameAllocator {
            memory_map,
            next: 0,
        }
    }

    fn usable_frames(&self) -> impl Iterator<Item = PhysFrame> {
        self.memory_map
            .iter()
            .filter(|r| r.region_type == MemoryRegionType::Usable)
            .map(|r| r.range.start_addr()..r.range.end_addr())
            .flat_map(|range| range.step_by(PAGE_SIZE as usize))
            .map(|addr| PhysFrame::containing_address(PhysAddr::new(addr)))
    }
}

// SAFETY: each usable frame is returned at most once.
unsafe impl FrameAllocator<Size4KiB> for BootInfoFrameAllocator {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        let frame = self.usable_frames().nth(self.next);
        self.next += 1;
        frame
    }
}

static FRAMES: Mutex<Option<BootInfoFrameAllocator>> = Mutex::new(None);

/// Installs the kernel-wide frame allocator.
///
/// # Safety
///
/// Same contract as [`BootInfoFrameAllocator::init`]; must be called once.
pub unsafe fn init_frames(memory_map: &'static MemoryMap) {
    // SAFETY: forwarded from the caller.
    let allocator = unsafe { BootInfoFrameAllocator::init(memory_map) };
    *FRAMES.lock() = Some(allocator);
}

/// Handle to the kernel-wide frame allocator. Allocation fails until
/// [`init_frames`] ran.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelFrames;

// SAFETY: delegates to the single global `BootInfoFrameAllocator`.
unsafe impl FrameAllocator<Size4KiB> for KernelFrames {
    fn allocate_frame(&mut self) -> Option<PhysFrame> {
        x86_64::instructions::interrupts::without_interrupts(|| {
            FRAMES.lock().as_mut()?.allocate_frame()
        })
    }
}

impl vireo_hal::FrameAllocator for KernelFrames {
    fn alloc_frame(&mut self) -> Option<vireo_hal::PhysAddr> {
        let frame = FrameAllocator::<Size4KiB>::allocate_frame(self)?;
        Some(vireo_hal::PhysAddr::new(frame.start_address().as_u64()))
    }
}

/// The active page table, seen as an [`AddressSpace`].
pub struct ActiveSpace<'a> {
    mapper: &'a mut OffsetPageTable<'static>,
    frames: KernelFrames,
}

impl<'a> ActiveSpace<'a> {
    /// Wraps `mapper`; page tables it needs come from [`KernelFrames`].
    pub fn new(mapper: &'a mut OffsetPageTable<'static>) -> Self {
        ActiveSpace {
            mapper,
            frames: KernelFrames,
        }
    }

    fn page(vaddr: vireo_hal::VirtAddr) -> Page {
        Page::containing_address(VirtAddr::new(vaddr.as_u64()))
    }

    fn flags_of(&self, vaddr: vireo_hal::VirtAddr) -> Option<PageTableFlags> {
        match self.mapper.translate(VirtAddr::new(vaddr.page_floor().as_u64())) {
            TranslateResult::Mapped { flags, .. } => Some(flags),
            _ => None,
        }
    }
}

impl AddressSpace for ActiveSpace<'_> {
    fn is_mapped(&self, vaddr: vireo_hal::VirtAddr) -> bool {
        self.mapper.translate_page(Self::page(vaddr)).is_ok()
    }

    fn map_page(
        &mut self,
        vaddr: vireo_hal::VirtAddr,
        paddr: vireo_hal::PhysAddr,
        user: bool,
        writable: bool,
    ) -> Result<(), MapError> {
        let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(paddr.as_u64()));
        let mut flags = PageTableFlags::PRESENT;
        let mut parent = PageTableFlags::PRESENT | PageTableFlags::WRITABLE;
        if user {
            flags |= PageTableFlags::USER_ACCESSIBLE;
            parent |= PageTableFlags::USER_ACCESSIBLE;
        }
        if writable {
            flags |= PageTableFlags::WRITABLE;
        }
        // SAFETY: `frame` was just handed out by the frame allocator and is
        // mapped nowhere else.
        let flush = unsafe {
            self.mapper.map_to_with_table_flags(
                Self::page(vaddr),
                frame,
                flags,
                parent,
                &mut self.frames,
            )
        }
        .map_err(|err| match err {
            MapToError::FrameAllocationFailed => MapError::PageTableAlloc,
            MapToError::PageAlreadyMapped(_) | MapToError::ParentEntryHugePage => {
                MapError::AlreadyMapped
            }
        })?;
        flush.flush();
        Ok(())
    }

    fn set_page_rw(&mut self, vaddr: vireo_hal::VirtAddr, writable: bool) -> Result<(), MapError> {
        let mut flags = self.flags_of(vaddr).ok_or(MapError::NotMapped)?;
        flags.set(PageTableFlags::WRITABLE, writable);
        // SAFETY: only the writable bit of an existing mapping changes.
        let flush = unsafe { self.mapper.update_flags(Self::page(vaddr), flags) }.map_err(
            |err| match err {
                FlagUpdateError::PageNotMapped | FlagUpdateError::ParentEntryHugePage => {
                    MapError::NotMapped
                }
            },
        )?;
        flush.flush();
        Ok(())
    }

    fn page_mut(&mut self, vaddr: vireo_hal::VirtAddr) -> Option<&mut [u8]> {
        let frame = self.mapper.translate_page(Self::page(vaddr)).ok()?;
        let virt = self.mapper.phys_offset() + frame.start_address().as_u64();
        // SAFETY: the frame is reachable through the physical memory window
        // and the returned borrow is tied to `&mut self`, which owns the only
        // handle to the page table.
        Some(unsafe { core::slice::from_raw_parts_mut(virt.as_mut_ptr::<u8>(), PAGE_SIZE as usize) })
    }
}
