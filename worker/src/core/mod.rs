//! Deterministic, pure logic shared by the worker.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod delivery;
pub mod events;
pub mod failure;
pub mod prompt;
pub mod report;
pub mod tail;
pub mod types;
