//! Kernel heap.
//!
//! The heap is a fixed window of kernel-only pages mapped at boot through
//! the same [`AddressSpace`] seam the loader uses, then handed to a
//! `linked_list_allocator` heap as the global allocator.

use core::fmt;
use vireo_common::MapError;
use vireo_hal::{AddressSpace, FrameAllocator, VirtAddr, PAGE_SIZE};

/// Why the heap window could not be mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    /// The frame allocator ran dry.
    OutOfFrames,
    /// A heap page could not be mapped.
    Map(MapError),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeapError::OutOfFrames => write!(f, "out of frames for the heap"),
            HeapError::Map(err) => write!(f, "heap mapping failed: {}", err),
        }
    }
}

impl From<MapError> for HeapError {
    fn from(err: MapError) -> Self {
        HeapError::Map(err)
    }
}

/// Maps `[start, start + size)` as writable kernel pages, each backed by a
/// fresh frame. Returns the number of pages mapped.
pub fn map_heap<A, P>(space: &mut A, frames: &mut P, start: VirtAddr, size: u64) -> Result<usize, HeapError>
where
    A: AddressSpace,
    P: FrameAllocator,
{
    let pages = size.div_ceil(PAGE_SIZE);
    let first = start.page_floor();
    for i in 0..pages {
        let page = VirtAddr::new(first.as_u64() + i * PAGE_SIZE);
        let frame = frames.alloc_frame().ok_or(HeapError::OutOfFrames)?;
        space.map_page(page, frame, false, true)?;
    }
    Ok(pages as usize)
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod global {
    use super::{map_heap, HeapError};
    use crate::config::{HEAP_SIZE, HEAP_START};
    use crate::memory::{ActiveSpace, KernelFrames};
    use linked_list_allocator::LockedHeap;
    use vireo_hal::VirtAddr;
    use x86_64::structures::paging::OffsetPageTable;

    #[global_allocator]
    static ALLOCATOR: LockedHeap = LockedHeap::empty();

    /// Maps the heap window in the active page table and installs it as
    /// the global allocator. Call once, before anything allocates.
    pub fn init_heap(mapper: &mut OffsetPageTable<'static>) -> Result<(), HeapError> {
        let start = VirtAddr::new(HEAP_START as u64);
        let pages = map_heap(&mut ActiveSpace::new(mapper), &mut KernelFrames, start, HEAP_SIZE as u64)?;

        // SAFETY: the window was just mapped writable and is reserved for
        // the heap; this runs once during boot.
        unsafe {
            ALLOCATOR.lock().init(HEAP_START as *mut u8, HEAP_SIZE);
        }
        log::info!("heap: {} KiB in {} pages at {:#x}", HEAP_SIZE / 1024, pages, HEAP_START);
        Ok(())
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use global::init_heap;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{SimAddressSpace, SimFrames};

    const START: u64 = 0x4444_4444_0000;

    #[test]
    fn test_heap_pages_are_kernel_writable() {
        let mut space = SimAddressSpace::new();
        let pages = map_heap(&mut space, &mut SimFrames::new(), VirtAddr::new(START), 3 * PAGE_SIZE)
            .expect("map heap");

        assert_eq!(pages, 3);
        assert_eq!(space.mapped_pages(), 3);
        let last = VirtAddr::new(START + 2 * PAGE_SIZE);
        assert_eq!(space.is_writable(last), Some(true));
        assert_eq!(space.is_user(last), Some(false));
        assert_eq!(space.is_writable(VirtAddr::new(START + 3 * PAGE_SIZE)), None);
    }

    #[test]
    fn test_partial_page_rounds_up() {
        let mut space = SimAddressSpace::new();
        let pages = map_heap(&mut space, &mut SimFrames::new(), VirtAddr::new(START), PAGE_SIZE + 1)
            .expect("map heap");
        assert_eq!(pages, 2);
    }

    #[test]
    fn test_out_of_frames() {
        let mut space = SimAddressSpace::new();
        let mut frames = SimFrames::with_limit(2);
        assert_eq!(
            map_heap(&mut space, &mut frames, VirtAddr::new(START), 4 * PAGE_SIZE),
            Err(HeapError::OutOfFrames)
        );
        assert_eq!(space.mapped_pages(), 2);
    }

    #[test]
    fn test_overlap_is_a_map_error() {
        let mut space = SimAddressSpace::new();
        let mut frames = SimFrames::new();
        map_heap(&mut space, &mut frames, VirtAddr::new(START), PAGE_SIZE).expect("map heap");
        assert_eq!(
            map_heap(&mut space, &mut frames, VirtAddr::new(START), PAGE_SIZE),
            Err(HeapError::Map(MapError::AlreadyMapped))
        );
    }
}
