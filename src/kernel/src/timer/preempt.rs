//! Preemption control and interrupt nesting depth.

use core::num::NonZeroU32;
use core::sync::atomic::{AtomicU32, Ordering};

/// Counts the reasons preemption is currently disabled.
///
/// Starts at 1: preemption stays off during boot until [`enable`] is
/// called once the scheduler is ready. The IRQ dispatch path holds one
/// [`PreemptGuard`] of its own, so inside the timer handler a count of 1 is
/// the steady state and anything above it means some other code disabled
/// preemption.
///
/// [`enable`]: PreemptionCounter::enable
pub struct PreemptionCounter {
    count: AtomicU32,
}

impl Default for PreemptionCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl PreemptionCounter {
    /// A counter in the boot state (disabled once).
    pub const fn new() -> Self {
        PreemptionCounter {
            count: AtomicU32::new(1),
        }
    }

    /// Disables preemption until the returned guard is dropped.
    pub fn disable(&self) -> PreemptGuard<'_> {
        self.count.fetch_add(1, Ordering::Acquire);
        PreemptGuard { counter: self }
    }

    /// Drops one disable reason that is not tied to a guard, such as the
    /// boot-time hold.
    pub fn enable(&self) {
        let released = self
            .count
            .fetch_update(Ordering::Release, Ordering::Relaxed, |n| n.checked_sub(1));
        assert!(released.is_ok(), "preemption enabled more often than disabled");
    }

    /// Current count.
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    /// From inside the IRQ path: whether anything besides the dispatch
    /// path's own guard holds preemption off.
    pub fn is_suppressed(&self) -> bool {
        self.count() > 1
    }
}

/// Keeps preemption disabled while alive.
#[must_use = "preemption is re-enabled when the guard is dropped"]
pub struct PreemptGuard<'a> {
    counter: &'a PreemptionCounter,
}

impl Drop for PreemptGuard<'_> {
    fn drop(&mut self) {
        self.counter.enable();
    }
}

/// How deeply interrupts are nested at a handler's entry; 1 means the
/// handler interrupted ordinary task code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct IrqDepth(NonZeroU32);

impl IrqDepth {
    /// A handler that interrupted task code.
    pub const fn outermost() -> Self {
        IrqDepth(NonZeroU32::MIN)
    }

    /// Depth of a handler entered while `active` other handlers were
    /// already running.
    pub fn entered_over(active: u32) -> Self {
        IrqDepth(NonZeroU32::MIN.saturating_add(active))
    }

    /// Depth of an interrupt arriving inside this one.
    pub fn nested(self) -> Self {
        IrqDepth(self.0.saturating_add(1))
    }

    /// The raw depth.
    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Whether another handler was interrupted.
    pub fn is_nested(self) -> bool {
        self.get() > 1
    }
}

/// Proof that the caller is an IRQ dispatch path: it fixes the nesting
/// depth and holds preemption off for the handler's duration.
pub struct IrqContext<'a> {
    depth: IrqDepth,
    _preempt: PreemptGuard<'a>,
}

impl<'a> IrqContext<'a> {
    pub(crate) fn new(depth: IrqDepth, preempt: PreemptGuard<'a>) -> Self {
        IrqContext {
            depth,
            _preempt: preempt,
        }
    }

    /// Nesting depth at entry.
    pub fn depth(&self) -> IrqDepth {
        self.depth
    }
}
