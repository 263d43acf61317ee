//! Task identity and scheduling state as seen by the timer core.

use core::fmt;

/// Opaque reference to a task owned by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskId(u32);

impl TaskId {
    /// The boot task that exists before any process is created.
    pub const KERNEL: TaskId = TaskId(0);

    /// Runs when no other task is runnable. It never sleeps.
    pub const IDLE: TaskId = TaskId(u32::MAX);

    /// Wrap a raw task number.
    pub const fn new(raw: u32) -> Self {
        TaskId(raw)
    }

    /// The raw task number.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == TaskId::IDLE {
            write!(f, "idle task")
        } else {
            write!(f, "task {}", self.0)
        }
    }
}

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TaskState {
    /// Currently executing on the CPU.
    Running,
    /// Eligible to run.
    Runnable,
    /// Blocked on a timer slot.
    Sleeping,
    /// Exited, waiting to be reaped.
    Zombie,
}

/// What a blocked task is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WaitObject {
    /// Not waiting.
    #[default]
    None,
    /// Waiting for the timer slot at `slot` to fire.
    Timer {
        /// Index into the timer table.
        slot: usize,
    },
}
