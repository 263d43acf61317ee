//! Interrupt Descriptor Table (IDT) and exception handlers for x86_64.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::x86_64::gdt;
use crate::arch::x86_64::pic::{self, InterruptIndex, PICS};
use crate::task::{SavedFrame, TASKS};
use crate::timer::{self, IrqDepth, TickOutcome};
use lazy_static::lazy_static;
use vireo_hal::{InterruptController, Scheduler};
use x86_64::instructions::interrupts;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

lazy_static! {
    /// The Interrupt Descriptor Table (IDT).
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        // SAFETY: the IST index names the stack the GDT module installs in
        // the TSS.
        unsafe {
            idt.double_fault.set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt.page_fault.set_handler_fn(page_fault_handler);
        idt.general_protection_fault.set_handler_fn(general_protection_fault_handler);
        idt.divide_error.set_handler_fn(divide_error_handler);

        idt[InterruptIndex::Timer.as_usize()]
            .set_handler_fn(timer_interrupt_handler);

        idt
    };
}

/// Handlers currently executing.
static IRQ_DEPTH: AtomicU32 = AtomicU32::new(0);

/// Loads the IDT and remaps the PICs. Interrupts stay disabled.
pub fn init_idt() {
    IDT.load();
    // SAFETY: the PIC offsets used by `PICS` point at vectors the IDT above
    // reserves for hardware interrupts.
    unsafe {
        PICS.lock().initialize();
    }
}

/// Enables hardware interrupts.
pub fn enable() {
    interrupts::enable();
}

/// The CPU's interrupt flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuInterrupts;

impl InterruptController for CpuInterrupts {
    fn save_and_disable(&self) -> bool {
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        was_enabled
    }

    fn restore(&self, was_enabled: bool) {
        if was_enabled {
            interrupts::enable();
        }
    }
}

/// Handler for the timer interrupt.
extern "x86-interrupt" fn timer_interrupt_handler(stack_frame: InterruptStackFrame) {
    let depth = IrqDepth::entered_over(IRQ_DEPTH.fetch_add(1, Ordering::Acquire));

    if let Some(timer) = timer::subsystem() {
        let ctx = timer.enter_irq(depth);
        let frame = SavedFrame {
            instruction_pointer: stack_frame.instruction_pointer.as_u64(),
            stack_pointer: stack_frame.stack_pointer.as_u64(),
            cpu_flags: stack_frame.cpu_flags,
        };
        // Task context only holds the table with interrupts off, so a busy
        // lock means this handler interrupted another one.
        match TASKS.try_lock() {
            Some(mut tasks) => match timer.on_tick(&ctx, &frame, &mut *tasks) {
                TickOutcome::Switched(task) => log::trace!("tick: switched to {}", task),
                TickOutcome::Rescheduled => {
                    log::trace!("tick: rescheduled, now {}", tasks.current_task())
                }
                _ => {}
            },
            None => log::warn!("tick {}: task table busy", timer.ticks()),
        }
    }

    pic::end_of_interrupt(InterruptIndex::Timer);
    IRQ_DEPTH.fetch_sub(1, Ordering::Release);
}

/// Handler for the breakpoint exception (INT3).
extern "x86-interrupt" fn breakpoint_handler(stack_frame: InterruptStackFrame) {
    log::warn!("EXCEPTION: BREAKPOINT\n{:#?}", stack_frame);
}

/// Handler for the double fault exception.
extern "x86-interrupt" fn double_fault_handler(
    stack_frame: InterruptStackFrame,
    _error_code: u64,
) -> ! {
    panic!("EXCEPTION: DOUBLE FAULT\n{:#?}", stack_frame);
}

/// Handler for the page fault exception.
extern "x86-interrupt" fn page_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: PageFaultErrorCode,
) {
    use x86_64::registers::control::Cr2;

    log::error!("EXCEPTION: PAGE FAULT");
    log::error!("Accessed Address: {:?}", Cr2::read());
    log::error!("Error Code: {:?}", error_code);
    log::error!("{:#?}", stack_frame);
    crate::arch::x86_64::halt_loop();
}

/// Handler for the general protection fault exception.
extern "x86-interrupt" fn general_protection_fault_handler(
    stack_frame: InterruptStackFrame,
    error_code: u64,
) {
    log::error!("EXCEPTION: GENERAL PROTECTION FAULT");
    log::error!("Error Code: {:#x}", error_code);
    log::error!("{:#?}", stack_frame);
    crate::arch::x86_64::halt_loop();
}

/// Handler for the divide error exception.
extern "x86-interrupt" fn divide_error_handler(stack_frame: InterruptStackFrame) {
    log::error!("EXCEPTION: DIVIDE ERROR\n{:#?}", stack_frame);
    crate::arch::x86_64::halt_loop();
}
