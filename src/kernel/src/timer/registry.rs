//! Fixed-capacity sleep timer table.
//!
//! Each slot holds one outstanding "wake me after N ticks" request. Slots
//! are claimed and released with compare-and-swap on the owner word, so
//! both task context and the timer IRQ can touch the table without a lock.
//!
//! The owner word encodes the slot's state:
//!
//! | value          | state                         |
//! |----------------|-------------------------------|
//! | `0`            | free                          |
//! | `u64::MAX`     | reserved (claimed, not ready) |
//! | `task + 1`     | assigned to `task`            |

use core::sync::atomic::{AtomicU64, Ordering};
use vireo_common::{TaskId, TaskState, TimerError, WaitObject};
use vireo_hal::{InterruptController, Scheduler};

const FREE: u64 = 0;
const RESERVED: u64 = u64::MAX;

fn encode(task: TaskId) -> u64 {
    u64::from(task.as_u32()) + 1
}

fn decode(raw: u64) -> Option<TaskId> {
    match raw {
        FREE | RESERVED => None,
        // Task numbers are 32-bit, so `raw - 1` always fits.
        _ => Some(TaskId::new((raw - 1) as u32)),
    }
}

/// Snapshot of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Available for registration.
    Free,
    /// Claimed by a registration that has not published its task yet.
    Reserved,
    /// Counting down for `task`.
    Assigned {
        /// The sleeping task.
        task: TaskId,
        /// Ticks until it wakes.
        ticks_left: u64,
    },
}

struct Slot {
    owner: AtomicU64,
    ticks_left: AtomicU64,
}

impl Slot {
    const EMPTY: Slot = Slot {
        owner: AtomicU64::new(FREE),
        ticks_left: AtomicU64::new(0),
    };
}

/// Tasks woken by one [`TimerTable::tick`] pass, in scan order.
///
/// Holds at most one entry per slot, so it never allocates.
#[derive(Debug, Clone, Copy)]
pub struct WokenTasks<const N: usize> {
    tasks: [Option<TaskId>; N],
    len: usize,
}

impl<const N: usize> WokenTasks<N> {
    fn new() -> Self {
        WokenTasks {
            tasks: [None; N],
            len: 0,
        }
    }

    fn push(&mut self, task: TaskId) {
        // One entry per slot at most.
        self.tasks[self.len] = Some(task);
        self.len += 1;
    }

    /// Number of tasks woken.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing fired.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The task found last during the scan.
    pub fn last(&self) -> Option<TaskId> {
        self.len.checked_sub(1).and_then(|i| self.tasks[i])
    }

    /// Whether `task` was woken.
    pub fn contains(&self, task: TaskId) -> bool {
        self.iter().any(|t| t == task)
    }

    /// Woken tasks in scan order.
    pub fn iter(&self) -> impl Iterator<Item = TaskId> + '_ {
        self.tasks[..self.len].iter().flatten().copied()
    }
}

/// The sleep timer table with `N` slots.
pub struct TimerTable<const N: usize> {
    slots: [Slot; N],
}

impl<const N: usize> Default for TimerTable<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> TimerTable<N> {
    /// A table with every slot free.
    pub const fn new() -> Self {
        TimerTable {
            slots: [Slot::EMPTY; N],
        }
    }

    /// Number of slots.
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Arranges for `task` to be woken after `ticks` timer interrupts.
    ///
    /// Links the task's wait object to the claimed slot and returns the
    /// slot index. The task must not already own a slot.
    pub fn register<S: Scheduler>(
        &self,
        task: TaskId,
        ticks: u64,
        sched: &mut S,
    ) -> Result<usize, TimerError> {
        if ticks == 0 {
            return Err(TimerError::ZeroTicks);
        }
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .owner
                .compare_exchange(FREE, RESERVED, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                continue;
            }
            slot.ticks_left.store(ticks, Ordering::Relaxed);
            sched.set_wait_object(task, WaitObject::Timer { slot: index });
            // Publishing the owner makes the slot visible to `tick`.
            slot.owner.store(encode(task), Ordering::Release);
            return Ok(index);
        }
        log::warn!("timer table full ({} slots), {} not registered", N, task);
        Err(TimerError::TableFull)
    }

    /// Releases `slot` if `task` still owns it.
    ///
    /// Returns whether this call released it. A slot that already fired,
    /// was cancelled, or now belongs to another task is left alone.
    pub fn cancel<S: Scheduler>(&self, slot: usize, task: TaskId, sched: &mut S) -> bool {
        let Some(entry) = self.slots.get(slot) else {
            return false;
        };
        let released = entry
            .owner
            .compare_exchange(encode(task), FREE, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok();
        if released {
            sched.reset_wait_object(task);
        }
        released
    }

    /// Advances every countdown by one tick.
    ///
    /// Each slot that reaches zero is released and its task made runnable.
    /// A slot is only woken if this pass wins the release; a `cancel` that
    /// got there first takes precedence and the task is left untouched.
    pub fn tick<S, I>(&self, irq: &I, sched: &mut S) -> WokenTasks<N>
    where
        S: Scheduler,
        I: InterruptController,
    {
        let mut woken = WokenTasks::new();
        for slot in &self.slots {
            if decode(slot.owner.load(Ordering::Relaxed)).is_none() {
                continue;
            }
            let fired = irq.without_interrupts(|| {
                let raw = slot.owner.load(Ordering::Acquire);
                let task = decode(raw)?;
                let left = slot.ticks_left.load(Ordering::Relaxed).saturating_sub(1);
                slot.ticks_left.store(left, Ordering::Relaxed);
                if left > 0 {
                    return None;
                }
                debug_assert_ne!(
                    sched.current_task(),
                    task,
                    "sleeping task is running"
                );
                slot.owner
                    .compare_exchange(raw, FREE, Ordering::AcqRel, Ordering::Relaxed)
                    .ok()?;
                sched.reset_wait_object(task);
                sched.change_state(task, TaskState::Runnable);
                Some(task)
            });
            if let Some(task) = fired {
                log::trace!("timer woke {}", task);
                woken.push(task);
            }
        }
        woken
    }

    /// Snapshot of the slot at `index`.
    pub fn slot_state(&self, index: usize) -> Option<SlotState> {
        let slot = self.slots.get(index)?;
        let raw = slot.owner.load(Ordering::Acquire);
        Some(match raw {
            FREE => SlotState::Free,
            RESERVED => SlotState::Reserved,
            _ => SlotState::Assigned {
                task: decode(raw)?,
                ticks_left: slot.ticks_left.load(Ordering::Relaxed),
            },
        })
    }

    /// Number of slots not free.
    pub fn occupied(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.owner.load(Ordering::Relaxed) != FREE)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{SimInterrupts, SimScheduler};

    #[test]
    fn test_encoding_round_trip_edges() {
        assert_eq!(decode(encode(TaskId::KERNEL)), Some(TaskId::KERNEL));
        assert_eq!(decode(encode(TaskId::new(u32::MAX))), Some(TaskId::new(u32::MAX)));
        assert_ne!(encode(TaskId::new(u32::MAX)), RESERVED);
        assert_eq!(decode(FREE), None);
        assert_eq!(decode(RESERVED), None);
    }

    #[test]
    fn test_register_zero_ticks_rejected() {
        let table = TimerTable::<4>::new();
        let mut sched = SimScheduler::new();
        let task = sched.spawn();

        assert_eq!(table.register(task, 0, &mut sched), Err(TimerError::ZeroTicks));
        assert_eq!(table.occupied(), 0);
    }

    #[test]
    fn test_register_links_wait_object() {
        let table = TimerTable::<4>::new();
        let mut sched = SimScheduler::new();
        let task = sched.spawn();

        let slot = table.register(task, 3, &mut sched).expect("register");
        assert_eq!(sched.wait_object(task), WaitObject::Timer { slot });
        assert_eq!(
            table.slot_state(slot),
            Some(SlotState::Assigned { task, ticks_left: 3 })
        );
    }

    #[test]
    fn test_table_full() {
        let table = TimerTable::<2>::new();
        let mut sched = SimScheduler::new();
        let a = sched.spawn();
        let b = sched.spawn();
        let c = sched.spawn();

        assert_eq!(table.register(a, 1, &mut sched), Ok(0));
        assert_eq!(table.register(b, 1, &mut sched), Ok(1));
        assert_eq!(table.register(c, 1, &mut sched), Err(TimerError::TableFull));
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let table = TimerTable::<4>::new();
        let mut sched = SimScheduler::new();
        let task = sched.spawn();
        let slot = table.register(task, 10, &mut sched).expect("register");

        assert!(table.cancel(slot, task, &mut sched));
        assert!(!table.cancel(slot, task, &mut sched));
        assert!(!table.cancel(99, task, &mut sched));
        assert_eq!(table.slot_state(slot), Some(SlotState::Free));
        assert_eq!(sched.wait_object(task), WaitObject::None);
    }

    #[test]
    fn test_cancel_after_fire_is_noop() {
        let table = TimerTable::<4>::new();
        let irq = SimInterrupts::new();
        let mut sched = SimScheduler::new();
        let task = sched.spawn();
        sched.change_state(task, TaskState::Sleeping);
        let slot = table.register(task, 1, &mut sched).expect("register");

        assert!(table.tick(&irq, &mut sched).contains(task));
        assert_eq!(sched.state(task), TaskState::Runnable);

        // The task has since blocked on something else.
        sched.set_wait_object(task, WaitObject::Timer { slot: 3 });
        assert!(!table.cancel(slot, task, &mut sched));
        assert_eq!(table.slot_state(slot), Some(SlotState::Free));
        assert_eq!(sched.state(task), TaskState::Runnable);
        assert_eq!(sched.wait_object(task), WaitObject::Timer { slot: 3 });
    }

    #[test]
    fn test_cancel_after_fire_leaves_reused_slot() {
        let table = TimerTable::<4>::new();
        let irq = SimInterrupts::new();
        let mut sched = SimScheduler::new();
        let fired = sched.spawn();
        let next = sched.spawn();
        let slot = table.register(fired, 1, &mut sched).expect("register");
        table.tick(&irq, &mut sched);

        assert_eq!(table.register(next, 5, &mut sched), Ok(slot));
        assert!(!table.cancel(slot, fired, &mut sched));
        assert_eq!(
            table.slot_state(slot),
            Some(SlotState::Assigned { task: next, ticks_left: 5 })
        );
        assert_eq!(sched.wait_object(next), WaitObject::Timer { slot });
    }

    #[test]
    fn test_cancel_wrong_owner_is_noop() {
        let table = TimerTable::<4>::new();
        let mut sched = SimScheduler::new();
        let owner = sched.spawn();
        let other = sched.spawn();
        let slot = table.register(owner, 10, &mut sched).expect("register");

        assert!(!table.cancel(slot, other, &mut sched));
        assert!(matches!(table.slot_state(slot), Some(SlotState::Assigned { task, .. }) if task == owner));
    }

    #[test]
    fn test_reserved_slot_skipped_by_tick() {
        let table = TimerTable::<2>::new();
        let mut sched = SimScheduler::new();
        table.slots[0].owner.store(RESERVED, Ordering::Relaxed);
        table.slots[0].ticks_left.store(1, Ordering::Relaxed);

        let woken = table.tick(&SimInterrupts::new(), &mut sched);
        assert!(woken.is_empty());
        assert_eq!(table.slot_state(0), Some(SlotState::Reserved));
    }

    #[test]
    fn test_register_skips_reserved_slot() {
        let table = TimerTable::<2>::new();
        let mut sched = SimScheduler::new();
        let task = sched.spawn();
        table.slots[0].owner.store(RESERVED, Ordering::Relaxed);

        assert_eq!(table.register(task, 1, &mut sched), Ok(1));
    }

    #[test]
    fn test_tick_countdown_in_critical_section() {
        let table = TimerTable::<4>::new();
        let irq = SimInterrupts::new();
        let mut sched = SimScheduler::new();
        let task = sched.spawn();
        sched.change_state(task, TaskState::Sleeping);
        table.register(task, 2, &mut sched).expect("register");

        assert!(table.tick(&irq, &mut sched).is_empty());
        assert_eq!(irq.critical_sections(), 1);
        assert!(irq.enabled());

        let woken = table.tick(&irq, &mut sched);
        assert_eq!(woken.last(), Some(task));
        assert_eq!(sched.state(task), TaskState::Runnable);
        assert_eq!(sched.wait_object(task), WaitObject::None);
    }

    #[test]
    fn test_tick_reports_every_woken_task() {
        let table = TimerTable::<4>::new();
        let irq = SimInterrupts::new();
        let mut sched = SimScheduler::new();
        let a = sched.spawn();
        let b = sched.spawn();
        for task in [a, b] {
            sched.change_state(task, TaskState::Sleeping);
            table.register(task, 1, &mut sched).expect("register");
        }

        let woken = table.tick(&irq, &mut sched);
        assert_eq!(woken.len(), 2);
        assert!(woken.contains(a) && woken.contains(b));
        assert_eq!(woken.last(), Some(b));
        assert_eq!(sched.state(a), TaskState::Runnable);
        assert_eq!(sched.state(b), TaskState::Runnable);
        assert_eq!(table.occupied(), 0);
    }
}
