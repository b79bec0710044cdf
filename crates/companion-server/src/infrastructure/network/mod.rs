//! Transport implementations.
//!
//! - `socket`: TCP + UDP sockets for real companion apps.
//! - `memory`: in-process queue used by tests and embedders.

pub mod memory;
pub mod socket;
