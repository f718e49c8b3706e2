//! Exchange requests: a typestate machine over PENDING, ACCEPTED and REJECTED.

pub mod state;
pub mod transitions;

pub use state::*;
