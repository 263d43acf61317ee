//! Kernel task table.
//!
//! The bookkeeping half of the scheduler: task states, wait links, the run
//! queue and the sleeping list. The register-level context switch is not
//! done here; `switch_to` records which task owns the CPU and the saved
//! frames are handed to the arch layer.
//!
//! Besides the boot task there is always an idle task. It never enters the
//! run queue or the sleeping list and owns the CPU only when nothing else
//! can run, so a task that goes to sleep always has somewhere to yield to.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use crossbeam_queue::ArrayQueue;
use lazy_static::lazy_static;
use spin::Mutex;
use vireo_common::{TaskId, TaskState, WaitObject};
use vireo_hal::{Scheduler, SwitchReason, VirtAddr};

use crate::config;

/// Register state captured when a task is interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SavedFrame {
    /// Interrupted instruction pointer.
    pub instruction_pointer: u64,
    /// Interrupted stack pointer.
    pub stack_pointer: u64,
    /// Interrupted flags register.
    pub cpu_flags: u64,
}

impl SavedFrame {
    /// Frame a new user task starts from.
    pub fn entry(entry: VirtAddr, stack_pointer: VirtAddr) -> Self {
        SavedFrame {
            instruction_pointer: entry.as_u64(),
            stack_pointer: stack_pointer.as_u64(),
            // IF set so the task runs with interrupts enabled.
            cpu_flags: 0x202,
        }
    }
}

#[derive(Debug)]
struct Task {
    state: TaskState,
    wait: WaitObject,
    frame: SavedFrame,
    ticks: u64,
}

impl Task {
    fn new(state: TaskState, frame: SavedFrame) -> Self {
        Task {
            state,
            wait: WaitObject::None,
            frame,
            ticks: 0,
        }
    }
}

/// Every task the kernel knows about.
pub struct TaskTable {
    tasks: BTreeMap<TaskId, Task>,
    current: TaskId,
    next_id: u32,
    run_queue: ArrayQueue<TaskId>,
    sleeping: Vec<TaskId>,
    slice_used: u32,
    need_resched: bool,
}

lazy_static! {
    /// The kernel's task table.
    ///
    /// Task context must lock it with interrupts disabled; the timer IRQ
    /// only ever `try_lock`s it.
    pub static ref TASKS: Mutex<TaskTable> = Mutex::new(TaskTable::new());
}

impl Default for TaskTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTable {
    /// A table holding the running kernel task and the idle task.
    pub fn new() -> Self {
        let mut tasks = BTreeMap::new();
        tasks.insert(TaskId::KERNEL, Task::new(TaskState::Running, SavedFrame::default()));
        tasks.insert(TaskId::IDLE, Task::new(TaskState::Runnable, SavedFrame::default()));
        TaskTable {
            tasks,
            current: TaskId::KERNEL,
            next_id: 1,
            run_queue: ArrayQueue::new(config::MAX_TASKS),
            sleeping: Vec::new(),
            slice_used: 0,
            need_resched: false,
        }
    }

    /// Adds a runnable task that will resume from `frame`.
    ///
    /// Returns `None` when the table is full.
    pub fn spawn(&mut self, frame: SavedFrame) -> Option<TaskId> {
        if self.len() >= config::MAX_TASKS {
            log::warn!("task table full");
            return None;
        }
        let id = TaskId::new(self.next_id);
        self.next_id += 1;
        self.tasks.insert(id, Task::new(TaskState::Zombie, frame));
        self.change_state(id, TaskState::Runnable);
        log::debug!("spawned {}", id);
        Some(id)
    }

    /// Number of tasks, the kernel task included and the idle task not.
    pub fn len(&self) -> usize {
        self.tasks.len() - 1
    }

    /// Whether only the kernel task exists.
    pub fn is_empty(&self) -> bool {
        self.len() <= 1
    }

    /// What `task` is blocked on.
    pub fn wait_object(&self, task: TaskId) -> WaitObject {
        self.tasks.get(&task).map_or(WaitObject::None, |t| t.wait)
    }

    /// Last saved frame of `task`.
    pub fn frame(&self, task: TaskId) -> Option<SavedFrame> {
        self.tasks.get(&task).map(|t| t.frame)
    }

    /// Ticks charged to `task`.
    pub fn ticks_run(&self, task: TaskId) -> u64 {
        self.tasks.get(&task).map_or(0, |t| t.ticks)
    }

    /// Forces a reschedule request, as a policy decision outside the
    /// time slice would.
    pub fn request_reschedule(&mut self) {
        self.need_resched = true;
    }

    fn enqueue(&self, task: TaskId) {
        if task == TaskId::IDLE {
            return;
        }
        if self.run_queue.push(task).is_err() {
            log::warn!("run queue full, {} not queued", task);
        }
    }
}

impl Scheduler for TaskTable {
    type Frame = SavedFrame;

    fn current_task(&self) -> TaskId {
        self.current
    }

    fn is_idle(&self, task: TaskId) -> bool {
        task == TaskId::IDLE
    }

    fn task_state(&self, task: TaskId) -> TaskState {
        self.tasks.get(&task).map_or(TaskState::Zombie, |t| t.state)
    }

    fn change_state(&mut self, task: TaskId, state: TaskState) {
        if task == TaskId::IDLE && !matches!(state, TaskState::Running | TaskState::Runnable) {
            log::warn!("refusing to move the idle task to {:?}", state);
            return;
        }
        let Some(entry) = self.tasks.get_mut(&task) else {
            log::warn!("state change for unknown {}", task);
            return;
        };
        let old = core::mem::replace(&mut entry.state, state);
        if old == state {
            return;
        }
        if old == TaskState::Sleeping {
            self.sleeping.retain(|&id| id != task);
        }
        match state {
            TaskState::Sleeping => self.sleeping.push(task),
            TaskState::Runnable => self.enqueue(task),
            TaskState::Running | TaskState::Zombie => {}
        }
    }

    fn set_wait_object(&mut self, task: TaskId, obj: WaitObject) {
        if let Some(entry) = self.tasks.get_mut(&task) {
            entry.wait = obj;
        }
    }

    fn reset_wait_object(&mut self, task: TaskId) {
        self.set_wait_object(task, WaitObject::None);
    }

    fn save_current_state(&mut self, frame: &SavedFrame) {
        if let Some(entry) = self.tasks.get_mut(&self.current) {
            entry.frame = *frame;
        }
    }

    fn switch_to(&mut self, task: TaskId, reason: SwitchReason) {
        if self.task_state(self.current) == TaskState::Running {
            self.change_state(self.current, TaskState::Runnable);
        }
        log::trace!("switch {} -> {} ({:?})", self.current, task, reason);
        self.change_state(task, TaskState::Running);
        self.current = task;
        self.slice_used = 0;
        self.need_resched = false;
    }

    fn invoke_scheduler(&mut self, reason: SwitchReason) {
        self.need_resched = false;
        while let Some(next) = self.run_queue.pop() {
            // Entries go stale when a queued task is woken and put back to
            // sleep before it ran.
            if next != self.current && self.task_state(next) == TaskState::Runnable {
                self.switch_to(next, reason);
                return;
            }
        }
        match self.task_state(self.current) {
            TaskState::Running => {}
            TaskState::Runnable => self.change_state(self.current, TaskState::Running),
            TaskState::Sleeping | TaskState::Zombie => self.switch_to(TaskId::IDLE, reason),
        }
    }

    fn reschedule_needed(&self) -> bool {
        self.need_resched
    }

    fn yield_now(&mut self) {
        self.invoke_scheduler(SwitchReason::Yield);
    }

    fn account_tick(&mut self) {
        if let Some(entry) = self.tasks.get_mut(&self.current) {
            entry.ticks += 1;
        }
        self.slice_used += 1;
        let slice_over = self.current == TaskId::IDLE || self.slice_used >= config::TIME_SLICE_TICKS;
        if slice_over && !self.run_queue.is_empty() {
            self.need_resched = true;
        }
    }

    fn for_each_sleeping(&self, f: &mut dyn FnMut(TaskId, TaskState)) {
        for &id in &self.sleeping {
            f(id, self.task_state(id));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_is_runnable() {
        let mut table = TaskTable::new();
        let task = table.spawn(SavedFrame::default()).expect("spawn");

        assert_eq!(table.task_state(task), TaskState::Runnable);
        assert_eq!(table.current_task(), TaskId::KERNEL);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_sleeping_list_follows_state() {
        let mut table = TaskTable::new();
        let task = table.spawn(SavedFrame::default()).expect("spawn");

        table.change_state(task, TaskState::Sleeping);
        let mut seen = Vec::new();
        table.for_each_sleeping(&mut |id, state| seen.push((id, state)));
        assert_eq!(seen, [(task, TaskState::Sleeping)]);

        table.change_state(task, TaskState::Runnable);
        let mut count = 0;
        table.for_each_sleeping(&mut |_, _| count += 1);
        assert_eq!(count, 0);
    }

    #[test]
    fn test_yield_round_robin() {
        let mut table = TaskTable::new();
        let a = table.spawn(SavedFrame::default()).expect("spawn");
        let b = table.spawn(SavedFrame::default()).expect("spawn");

        table.yield_now();
        assert_eq!(table.current_task(), a);
        assert_eq!(table.task_state(TaskId::KERNEL), TaskState::Runnable);

        table.yield_now();
        assert_eq!(table.current_task(), b);

        table.yield_now();
        assert_eq!(table.current_task(), TaskId::KERNEL);
    }

    #[test]
    fn test_yield_skips_sleeping_tasks() {
        let mut table = TaskTable::new();
        let a = table.spawn(SavedFrame::default()).expect("spawn");
        table.change_state(a, TaskState::Sleeping);

        table.yield_now();
        assert_eq!(table.current_task(), TaskId::KERNEL);
        assert_eq!(table.task_state(TaskId::KERNEL), TaskState::Running);
    }

    #[test]
    fn test_time_slice_requests_reschedule() {
        let mut table = TaskTable::new();
        table.spawn(SavedFrame::default()).expect("spawn");

        for _ in 0..config::TIME_SLICE_TICKS - 1 {
            table.account_tick();
        }
        assert!(!table.reschedule_needed());
        table.account_tick();
        assert!(table.reschedule_needed());
        assert_eq!(table.ticks_run(TaskId::KERNEL), u64::from(config::TIME_SLICE_TICKS));
    }

    #[test]
    fn test_time_slice_alone_never_reschedules() {
        let mut table = TaskTable::new();
        for _ in 0..config::TIME_SLICE_TICKS * 2 {
            table.account_tick();
        }
        assert!(!table.reschedule_needed());
    }

    #[test]
    fn test_save_current_state() {
        let mut table = TaskTable::new();
        let frame = SavedFrame {
            instruction_pointer: 0x1234,
            stack_pointer: 0x8000,
            cpu_flags: 0x202,
        };
        table.save_current_state(&frame);
        assert_eq!(table.frame(TaskId::KERNEL), Some(frame));
    }

    #[test]
    fn test_lone_sleeper_yields_to_idle() {
        let mut table = TaskTable::new();
        table.change_state(TaskId::KERNEL, TaskState::Sleeping);
        table.yield_now();

        assert_eq!(table.current_task(), TaskId::IDLE);
        assert_eq!(table.task_state(TaskId::IDLE), TaskState::Running);
        assert_eq!(table.task_state(TaskId::KERNEL), TaskState::Sleeping);
    }

    #[test]
    fn test_idle_leaves_as_soon_as_work_arrives() {
        let mut table = TaskTable::new();
        table.change_state(TaskId::KERNEL, TaskState::Sleeping);
        table.yield_now();

        table.change_state(TaskId::KERNEL, TaskState::Runnable);
        table.account_tick();
        assert!(table.reschedule_needed());
        table.invoke_scheduler(SwitchReason::Yield);
        assert_eq!(table.current_task(), TaskId::KERNEL);
        // Idle is never queued, so nothing is left behind it.
        assert_eq!(table.task_state(TaskId::IDLE), TaskState::Runnable);
        assert!(table.run_queue.is_empty());
    }

    #[test]
    fn test_idle_cannot_sleep() {
        let mut table = TaskTable::new();
        table.change_state(TaskId::IDLE, TaskState::Sleeping);

        assert_eq!(table.task_state(TaskId::IDLE), TaskState::Runnable);
        let mut count = 0;
        table.for_each_sleeping(&mut |_, _| count += 1);
        assert_eq!(count, 0);
        assert_eq!(table.len(), 1);
    }
}
