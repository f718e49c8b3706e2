//! Core domain types for the slot-swap engine.
//!
//! Pure state machines for slots and exchange requests. Transitions validate
//! in memory and persist only through a caller-owned unit of work.

pub mod exchange;
pub mod slot;
