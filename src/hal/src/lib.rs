//! Vireo Hardware Abstraction Layer (HAL) traits.
//!
//! This crate defines the contracts the loader and timer core consume:
//! file I/O, paging, physical frames, interrupt masking and the scheduler.
//! The kernel provides x86_64 implementations; tests provide in-memory ones.

#![no_std]

use core::fmt;
use vireo_common::{IoError, MapError, TaskId, TaskState, WaitObject};

/// Size of a page and of a physical frame.
pub const PAGE_SIZE: u64 = 4096;

/// A virtual address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VirtAddr(u64);

impl VirtAddr {
    /// Wrap a raw address.
    pub const fn new(addr: u64) -> Self {
        VirtAddr(addr)
    }

    /// The raw address.
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Start of the page containing this address.
    pub const fn page_floor(self) -> Self {
        VirtAddr(self.0 & !(PAGE_SIZE - 1))
    }

    /// Offset of this address inside its page.
    pub const fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }

    /// Round down to `align`, which must be a power of two.
    pub const fn align_down(self, align: u64) -> Self {
        VirtAddr(self.0 & !(align - 1))
    }

    /// Add `bytes`, or `None` on overflow.
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(VirtAddr)
    }

    /// Subtract `bytes`, or `None` on underflow.
    pub fn checked_sub(self, bytes: u64) -> Option<Self> {
        self.0.checked_sub(bytes).map(VirtAddr)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A physical address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(u64);

impl PhysAddr {
    /// Wrap a raw address.
    pub const fn new(addr: u64) -> Self {
        PhysAddr(addr)
    }

    /// The raw address.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Seek origin for [`FileIo::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    /// Absolute offset from the start of the file.
    Start(u64),
    /// Relative to the current position.
    Current(i64),
}

/// An open file the loader reads an image from.
pub trait FileIo {
    /// Reads up to `buf.len()` bytes, returning how many were read.
    /// `Ok(0)` means end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError>;

    /// Moves the file position, returning the new absolute offset.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, IoError>;

    /// Fills `buf` completely or fails with [`IoError::UnexpectedEof`].
    fn read_exact(&mut self, mut buf: &mut [u8]) -> Result<(), IoError> {
        while !buf.is_empty() {
            match self.read(buf)? {
                0 => return Err(IoError::UnexpectedEof),
                n => buf = &mut buf[n..],
            }
        }
        Ok(())
    }
}

/// Source of physical frames.
pub trait FrameAllocator {
    /// Returns a free frame, or `None` when memory is exhausted.
    ///
    /// The frame's contents are unspecified.
    fn alloc_frame(&mut self) -> Option<PhysAddr>;
}

/// A user address space being populated.
///
/// The caller guarantees exclusive access for as long as it is borrowed.
pub trait AddressSpace {
    /// Whether `vaddr`'s page has a mapping.
    fn is_mapped(&self, vaddr: VirtAddr) -> bool;

    /// Maps the page at `vaddr` to the frame at `paddr`.
    fn map_page(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        user: bool,
        writable: bool,
    ) -> Result<(), MapError>;

    /// Changes the writable bit of an existing mapping.
    fn set_page_rw(&mut self, vaddr: VirtAddr, writable: bool) -> Result<(), MapError>;

    /// Kernel view of the page containing `vaddr`, independent of the page's
    /// user permissions. `None` if the page is not mapped.
    fn page_mut(&mut self, vaddr: VirtAddr) -> Option<&mut [u8]>;
}

/// Local interrupt masking.
pub trait InterruptController {
    /// Disables interrupts and returns whether they were enabled.
    fn save_and_disable(&self) -> bool;

    /// Restores the state returned by [`save_and_disable`](Self::save_and_disable).
    fn restore(&self, was_enabled: bool);

    /// Runs `f` with interrupts disabled.
    fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R
    where
        Self: Sized,
    {
        let was_enabled = self.save_and_disable();
        let ret = f();
        self.restore(was_enabled);
        ret
    }
}

/// Why the CPU is being handed to another task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    /// Preemption from the given hardware IRQ line.
    Irq(u8),
    /// The running task gave up the CPU.
    Yield,
}

/// The scheduler, as seen by the timer core.
pub trait Scheduler {
    /// Register state captured at interrupt entry.
    type Frame;

    /// The task currently owning the CPU.
    fn current_task(&self) -> TaskId;

    /// Whether `task` is the one that runs when nothing else can. It must
    /// never be put to sleep.
    fn is_idle(&self, task: TaskId) -> bool {
        let _ = task;
        false
    }

    /// State of `task`.
    fn task_state(&self, task: TaskId) -> TaskState;

    /// Moves `task` to `state`, keeping run and sleep lists in step.
    fn change_state(&mut self, task: TaskId, state: TaskState);

    /// Links `task` to what it is blocked on.
    fn set_wait_object(&mut self, task: TaskId, obj: WaitObject);

    /// Clears `task`'s wait link.
    fn reset_wait_object(&mut self, task: TaskId);

    /// Saves the interrupted register state of the current task.
    fn save_current_state(&mut self, frame: &Self::Frame);

    /// Hands the CPU to `task`.
    fn switch_to(&mut self, task: TaskId, reason: SwitchReason);

    /// Runs the general scheduling policy.
    fn invoke_scheduler(&mut self, reason: SwitchReason);

    /// Whether the policy wants a reschedule for reasons of its own.
    fn reschedule_needed(&self) -> bool;

    /// Gives up the CPU voluntarily.
    fn yield_now(&mut self);

    /// Charges one tick to the current task.
    fn account_tick(&mut self) {}

    /// Visits every task on the sleeping list with its recorded state.
    fn for_each_sleeping(&self, f: &mut dyn FnMut(TaskId, TaskState));
}
