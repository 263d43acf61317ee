//! Architecture-specific implementations.
//!
//! Currently supported: x86_64.

pub mod x86_64;
