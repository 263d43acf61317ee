//! Shared value types for the Vireo kernel.
//!
//! Everything here is plain data: task identity and state, ELF segment
//! permissions, and the error taxonomy surfaced to process creation.

#![no_std]

pub mod error;
pub mod segment;
pub mod task;

pub use error::{IoError, LoadError, MapError, TimerError};
pub use segment::SegmentFlags;
pub use task::{TaskId, TaskState, WaitObject};
