//! Deterministic, pure logic shared by the controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod checklist;
pub mod dimensions;
pub mod history;
pub mod judgment;
pub mod strategy;
pub mod types;
