//! Vireo Kernel
//!
//! A small x86_64 kernel that loads ELF32 programs into user address spaces
//! and puts tasks to sleep on a timer-driven wake-up table.
//!
//! # Architecture
//!
//! The kernel is structured into the following modules:
//! - `loader`: ELF32 image validation and segment loading
//! - `timer`: sleep table, tick handler and preemption control
//! - `task`: task table and round-robin run queue
//! - `fs`: in-memory root filesystem
//! - `arch`, `memory`, `allocator`, `logger`: bare-metal support
//!
//! The loader, timer and task modules only talk to hardware through the
//! `vireo_hal` traits and are tested on the host.
//!
//! # Safety
//!
//! All unsafe code is documented with safety invariants explaining why the
//! usage is correct.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
#![warn(missing_docs)]

extern crate alloc;

pub mod allocator;
pub mod config;
pub mod fs;
pub mod loader;
pub mod logger;
pub mod task;
pub mod testutil;
pub mod timer;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod arch;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod memory;

/// Initializes core kernel subsystems.
///
/// Brings up the serial port, the logger, the GDT and the IDT. Interrupts
/// stay masked until [`arch::x86_64::interrupts::enable`] is called.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn init() {
    arch::x86_64::serial::init();
    logger::init(log::LevelFilter::Debug);
    arch::x86_64::gdt::init();
    arch::x86_64::interrupts::init_idt();
}
