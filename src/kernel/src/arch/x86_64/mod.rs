//! x86_64 architecture support.
//!
//! Serial output, descriptor tables, the legacy interrupt controllers and
//! the interval timer.

pub mod gdt;
pub mod interrupts;
pub mod pic;
pub mod pit;
pub mod serial;

pub use serial::SERIAL;

/// Halts the CPU until the next interrupt.
///
/// Used in idle loops to reduce power consumption.
#[inline]
pub fn hlt() {
    x86_64::instructions::hlt();
}

/// Halts the CPU in an infinite loop.
///
/// Used after unrecoverable errors (panics).
pub fn halt_loop() -> ! {
    loop {
        hlt();
    }
}
