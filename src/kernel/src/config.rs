//! Compile-time kernel configuration.

/// Capacity of the sleep timer table. Also the worst-case number of slots
/// scanned per tick.
pub const TIMER_SLOTS: usize = 64;

/// Timer interrupt frequency.
pub const TIMER_HZ: u32 = 100;

/// Ticks a task may run before the scheduler asks for a reschedule.
pub const TIME_SLICE_TICKS: u32 = 10;

/// Upper bound on tasks tracked by the kernel task table.
pub const MAX_TASKS: usize = 64;

/// First address user mappings may not reach.
pub const USER_SPACE_END: u64 = 0xC000_0000;

/// Pages reserved for the initial user stack, directly below
/// [`USER_SPACE_END`].
pub const USER_STACK_PAGES: u64 = 16;

/// Required alignment of the initial stack pointer.
pub const STACK_ALIGN: u64 = 16;

/// Most program headers an image may declare.
pub const MAX_PROGRAM_HEADERS: u16 = 64;

/// The start address of the kernel heap.
pub const HEAP_START: usize = 0x_4444_4444_0000;

/// The size of the kernel heap.
pub const HEAP_SIZE: usize = 256 * 1024;
