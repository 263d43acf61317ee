//! The timer interrupt path.

use core::sync::atomic::Ordering;
use vireo_common::TaskState;
use vireo_hal::{InterruptController, Scheduler, SwitchReason};

use super::{IrqContext, TimerSubsystem};

/// IRQ line of the programmable interval timer.
pub const TIMER_IRQ: u8 = 0;

/// What one timer interrupt did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The tick arrived inside another handler and was dropped.
    Nested,
    /// Sleepers were advanced but preemption is disabled.
    PreemptionDisabled,
    /// Nothing to switch to; the interrupted task resumes.
    Continue,
    /// A woken task was given the CPU.
    Switched(vireo_common::TaskId),
    /// The scheduler policy chose the next task.
    Rescheduled,
}

impl<I: InterruptController, const N: usize> TimerSubsystem<I, N> {
    /// Handles one timer interrupt.
    ///
    /// Advances every sleeper, then, if preemption is allowed, hands the CPU
    /// to the last task that woke or lets the scheduler run when it asked
    /// for it. `frame` is the interrupted task's register state.
    pub fn on_tick<S: Scheduler>(
        &self,
        ctx: &IrqContext<'_>,
        frame: &S::Frame,
        sched: &mut S,
    ) -> TickOutcome {
        if ctx.depth().is_nested() {
            self.nested_ticks.fetch_add(1, Ordering::Relaxed);
            return TickOutcome::Nested;
        }

        self.ticks.fetch_add(1, Ordering::Relaxed);
        sched.account_tick();
        let woken = self.table.tick(&self.irq, sched);

        if self.preemption.is_suppressed() {
            return TickOutcome::PreemptionDisabled;
        }

        #[cfg(debug_assertions)]
        check_sleeping_tasks(sched);

        if let Some(next) = woken.last() {
            let current = sched.current_task();
            if sched.task_state(current) == TaskState::Running {
                sched.change_state(current, TaskState::Runnable);
            }
            sched.save_current_state(frame);
            sched.switch_to(next, SwitchReason::Irq(TIMER_IRQ));
            return TickOutcome::Switched(next);
        }

        if sched.reschedule_needed() {
            sched.save_current_state(frame);
            sched.invoke_scheduler(SwitchReason::Irq(TIMER_IRQ));
            return TickOutcome::Rescheduled;
        }

        TickOutcome::Continue
    }
}

/// Panics if a task on the sleeping list is not in the sleeping state.
#[cfg(debug_assertions)]
fn check_sleeping_tasks<S: Scheduler>(sched: &S) {
    sched.for_each_sleeping(&mut |task, state| {
        assert_eq!(
            state,
            TaskState::Sleeping,
            "{} is on the sleeping list but {:?}",
            task,
            state
        );
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::SavedFrame;
    use crate::testutil::{SchedEvent, SimInterrupts, SimScheduler};
    use crate::timer::{IrqDepth, SlotState};
    use vireo_common::{TaskId, WaitObject};

    fn running_timer<const N: usize>() -> TimerSubsystem<SimInterrupts, N> {
        let timer = TimerSubsystem::new(SimInterrupts::new());
        timer.preemption().enable();
        timer
    }

    fn tick<const N: usize>(
        timer: &TimerSubsystem<SimInterrupts, N>,
        sched: &mut SimScheduler,
    ) -> TickOutcome {
        let ctx = timer.enter_irq(IrqDepth::outermost());
        timer.on_tick(&ctx, &SavedFrame::default(), sched)
    }

    fn sleeper(timer: &TimerSubsystem<SimInterrupts, 4>, sched: &mut SimScheduler, ticks: u64) -> (TaskId, usize) {
        let task = sched.spawn();
        sched.change_state(task, TaskState::Sleeping);
        let slot = timer.table().register(task, ticks, sched).expect("register");
        (task, slot)
    }

    #[test]
    fn test_sleep_five_ticks() {
        let timer = running_timer::<4>();
        let mut sched = SimScheduler::new();
        let (task, slot) = sleeper(&timer, &mut sched, 5);

        for left in (1..5).rev() {
            assert_eq!(tick(&timer, &mut sched), TickOutcome::Continue);
            assert_eq!(sched.state(task), TaskState::Sleeping);
            assert_eq!(
                timer.table().slot_state(slot),
                Some(SlotState::Assigned { task, ticks_left: left })
            );
        }

        assert_eq!(tick(&timer, &mut sched), TickOutcome::Switched(task));
        assert_eq!(timer.table().slot_state(slot), Some(SlotState::Free));
        assert_eq!(sched.wait_object(task), WaitObject::None);
        assert_eq!(sched.current_task(), task);
        assert_eq!(sched.state(TaskId::KERNEL), TaskState::Runnable);
        assert_eq!(timer.ticks(), 5);
    }

    #[test]
    fn test_switch_saves_interrupted_frame() {
        let timer = running_timer::<4>();
        let mut sched = SimScheduler::new();
        let (task, _) = sleeper(&timer, &mut sched, 1);

        assert_eq!(tick(&timer, &mut sched), TickOutcome::Switched(task));
        assert_eq!(
            sched.events(),
            [
                SchedEvent::Save,
                SchedEvent::Switch(task, SwitchReason::Irq(TIMER_IRQ)),
            ]
        );
    }

    #[test]
    fn test_multiple_wakeups_switch_to_last() {
        let timer = running_timer::<4>();
        let mut sched = SimScheduler::new();
        let (a, _) = sleeper(&timer, &mut sched, 1);
        let (b, _) = sleeper(&timer, &mut sched, 1);

        assert_eq!(tick(&timer, &mut sched), TickOutcome::Switched(b));
        assert_eq!(sched.state(a), TaskState::Runnable);
        assert_eq!(sched.state(b), TaskState::Running);
    }

    #[test]
    fn test_preemption_disabled_still_wakes() {
        let timer = running_timer::<4>();
        let mut sched = SimScheduler::new();
        let (task, slot) = sleeper(&timer, &mut sched, 1);

        let held = timer.preemption().disable();
        assert_eq!(tick(&timer, &mut sched), TickOutcome::PreemptionDisabled);
        drop(held);

        assert_eq!(sched.state(task), TaskState::Runnable);
        assert_eq!(timer.table().slot_state(slot), Some(SlotState::Free));
        assert_eq!(sched.current_task(), TaskId::KERNEL);
        assert!(sched.events().is_empty());
    }

    #[test]
    fn test_boot_hold_suppresses_preemption() {
        let timer = TimerSubsystem::<_, 4>::new(SimInterrupts::new());
        let mut sched = SimScheduler::new();
        let (task, _) = sleeper(&timer, &mut sched, 1);

        assert_eq!(tick(&timer, &mut sched), TickOutcome::PreemptionDisabled);
        assert_eq!(sched.state(task), TaskState::Runnable);
        assert_eq!(timer.preemption().count(), 1);
    }

    #[test]
    fn test_nested_tick_is_dropped() {
        let timer = running_timer::<4>();
        let mut sched = SimScheduler::new();
        let (task, slot) = sleeper(&timer, &mut sched, 1);

        let outer = timer.enter_irq(IrqDepth::outermost());
        let inner = timer.enter_irq(outer.depth().nested());
        let outcome = timer.on_tick(&inner, &SavedFrame::default(), &mut sched);

        assert_eq!(outcome, TickOutcome::Nested);
        assert_eq!(timer.nested_ticks(), 1);
        assert_eq!(timer.ticks(), 0);
        assert_eq!(sched.state(task), TaskState::Sleeping);
        assert!(matches!(timer.table().slot_state(slot), Some(SlotState::Assigned { ticks_left: 1, .. })));
    }

    #[test]
    fn test_reschedule_request_runs_policy() {
        let timer = running_timer::<4>();
        let mut sched = SimScheduler::new();
        let other = sched.spawn();
        sched.request_reschedule();

        assert_eq!(tick(&timer, &mut sched), TickOutcome::Rescheduled);
        assert_eq!(
            sched.events(),
            [
                SchedEvent::Save,
                SchedEvent::Schedule(SwitchReason::Irq(TIMER_IRQ)),
            ]
        );
        assert_eq!(sched.current_task(), other);
    }

    #[test]
    fn test_idle_tick_continues() {
        let timer = running_timer::<4>();
        let mut sched = SimScheduler::new();

        assert_eq!(tick(&timer, &mut sched), TickOutcome::Continue);
        assert!(sched.events().is_empty());
        assert_eq!(timer.ticks(), 1);
    }

    #[test]
    #[should_panic(expected = "is on the sleeping list but")]
    fn test_corrupt_sleeping_list_panics() {
        let timer = running_timer::<4>();
        let mut sched = SimScheduler::new();
        let task = sched.spawn();
        sched.force_sleeping_entry(task);

        tick(&timer, &mut sched);
    }
}
