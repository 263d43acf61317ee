#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![test_runner(vireo_kernel::testutil::test_runner)]
#![reexport_test_harness_main = "test_main"]

use core::panic::PanicInfo;
use vireo_hal::{InterruptController, VirtAddr};
use vireo_kernel::arch::x86_64::interrupts::CpuInterrupts;
use vireo_kernel::arch::x86_64::pit;
use vireo_kernel::loader::page_span;
use vireo_kernel::testutil::{exit_qemu, QemuExitCode};
use vireo_kernel::timer::{ms_to_ticks, IrqDepth, PreemptionCounter};

#[no_mangle]
pub extern "C" fn _start() -> ! {
    vireo_kernel::init();
    test_main();
    exit_qemu(QemuExitCode::Success);
    vireo_kernel::arch::x86_64::halt_loop()
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    vireo_kernel::testutil::test_panic_handler(info)
}

#[test_case]
fn critical_section_masks_interrupts() {
    let irq = CpuInterrupts;
    let inside = irq.without_interrupts(x86_64::instructions::interrupts::are_enabled);
    assert!(!inside);
}

#[test_case]
fn preemption_counter_boot_hold() {
    let counter = PreemptionCounter::new();
    {
        let _irq = counter.disable();
        assert!(counter.is_suppressed());
    }
    counter.enable();
    assert_eq!(counter.count(), 0);
}

#[test_case]
fn irq_depth_nesting() {
    assert!(!IrqDepth::outermost().is_nested());
    assert!(IrqDepth::entered_over(1).is_nested());
}

#[test_case]
fn page_span_crosses_boundary() {
    assert_eq!(
        page_span(VirtAddr::new(0x1FF0), 0x20),
        Some((VirtAddr::new(0x1000), 2))
    );
}

#[test_case]
fn pit_divisor_for_timer_rate() {
    assert_eq!(pit::divisor(100), 11_931);
    assert_eq!(pit::divisor(1), u16::MAX);
    assert_eq!(ms_to_ticks(25), 3);
}
