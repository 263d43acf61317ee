//! Timer-driven sleeping and preemption.
//!
//! [`TimerSubsystem`] owns all state shared between task context and the
//! timer interrupt: the sleep table, the tick counter and the preemption
//! counter. The kernel creates one at boot ([`init`]) and it lives for the
//! kernel's lifetime.

mod handler;
mod preempt;
pub mod registry;

pub use handler::{TickOutcome, TIMER_IRQ};
pub use preempt::{IrqContext, IrqDepth, PreemptGuard, PreemptionCounter};
pub use registry::{SlotState, TimerTable, WokenTasks};

use core::sync::atomic::{AtomicU64, Ordering};
use vireo_common::{TaskState, TimerError};
use vireo_hal::{InterruptController, Scheduler};

use crate::config;

/// Timer state shared by task context and the timer IRQ.
///
/// `N` is the sleep table capacity, fixed at compile time.
pub struct TimerSubsystem<I, const N: usize = { config::TIMER_SLOTS }> {
    table: TimerTable<N>,
    ticks: AtomicU64,
    nested_ticks: AtomicU64,
    preemption: PreemptionCounter,
    irq: I,
}

impl<I: InterruptController, const N: usize> TimerSubsystem<I, N> {
    /// A subsystem with an empty table, preemption still held off.
    pub const fn new(irq: I) -> Self {
        TimerSubsystem {
            table: TimerTable::new(),
            ticks: AtomicU64::new(0),
            nested_ticks: AtomicU64::new(0),
            preemption: PreemptionCounter::new(),
            irq,
        }
    }

    /// The sleep table.
    pub fn table(&self) -> &TimerTable<N> {
        &self.table
    }

    /// The preemption counter.
    pub fn preemption(&self) -> &PreemptionCounter {
        &self.preemption
    }

    /// The interrupt controller used for critical sections.
    pub fn interrupts(&self) -> &I {
        &self.irq
    }

    /// Timer interrupts handled since boot.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Timer interrupts that arrived inside another handler and were
    /// dropped.
    pub fn nested_ticks(&self) -> u64 {
        self.nested_ticks.load(Ordering::Relaxed)
    }

    /// Enters the timer IRQ path at `depth`, holding preemption off until
    /// the context is dropped.
    pub fn enter_irq(&self, depth: IrqDepth) -> IrqContext<'_> {
        IrqContext::new(depth, self.preemption.disable())
    }

    /// Puts the current task to sleep for `ticks` timer interrupts, then
    /// yields. `ticks == 0` just yields.
    pub fn sleep<S: Scheduler>(&self, ticks: u64, sched: &mut S) -> Result<(), TimerError> {
        if ticks > 0 {
            let task = sched.current_task();
            if sched.is_idle(task) {
                return Err(TimerError::IdleTask);
            }
            // A tick between the two steps would wake a task the scheduler
            // still thinks is running.
            self.irq.without_interrupts(|| {
                self.table.register(task, ticks, sched)?;
                sched.change_state(task, TaskState::Sleeping);
                Ok::<(), TimerError>(())
            })?;
        }
        sched.yield_now();
        Ok(())
    }

    /// Like [`sleep`](Self::sleep), in milliseconds.
    pub fn sleep_ms<S: Scheduler>(&self, ms: u64, sched: &mut S) -> Result<(), TimerError> {
        self.sleep(ms_to_ticks(ms), sched)
    }
}

/// Converts milliseconds to ticks at [`config::TIMER_HZ`], rounding up so a
/// non-zero sleep never becomes a plain yield.
pub fn ms_to_ticks(ms: u64) -> u64 {
    let hz = u64::from(config::TIMER_HZ);
    ms.saturating_mul(hz).div_ceil(1000)
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod global {
    use super::TimerSubsystem;
    use crate::arch::x86_64::interrupts::CpuInterrupts;
    use crate::task::TASKS;
    use conquer_once::spin::OnceCell;
    use vireo_common::TimerError;
    use vireo_hal::InterruptController;

    /// The kernel's timer subsystem type.
    pub type KernelTimer = TimerSubsystem<CpuInterrupts>;

    static SUBSYSTEM: OnceCell<KernelTimer> = OnceCell::uninit();

    /// Creates the kernel's timer subsystem. Later calls do nothing.
    pub fn init() {
        if SUBSYSTEM
            .try_init_once(|| TimerSubsystem::new(CpuInterrupts))
            .is_err()
        {
            log::warn!("timer subsystem already initialized");
        }
    }

    /// The kernel's timer subsystem, once [`init`] ran.
    pub fn subsystem() -> Option<&'static KernelTimer> {
        SUBSYSTEM.try_get().ok()
    }

    /// Sleeps the current kernel task for `ticks` timer interrupts.
    pub fn sleep(ticks: u64) -> Result<(), TimerError> {
        let Some(timer) = subsystem() else {
            return Ok(());
        };
        CpuInterrupts.without_interrupts(|| timer.sleep(ticks, &mut *TASKS.lock()))
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use global::{init, sleep, subsystem, KernelTimer};
