//! Test support.
//!
//! On the host: an in-memory file, a simulated address space and frame
//! pool, a recording interrupt controller and a scheduler backed by the
//! real [`TaskTable`](crate::task::TaskTable). Integration tests under
//! `tests/` reach these through `vireo_kernel::testutil`.
//!
//! On bare metal: the QEMU test runner. The host doubles are not built
//! into the kernel image.

#[cfg(not(target_os = "none"))]
mod sim;
#[cfg(not(target_os = "none"))]
pub use sim::*;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod qemu;
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use qemu::{exit_qemu, test_panic_handler, test_runner, QemuExitCode, Testable};
