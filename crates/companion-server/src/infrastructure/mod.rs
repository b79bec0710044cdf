//! Infrastructure layer for the companion server.
//!
//! Contains the OS-facing adapters (sockets, config file storage) and the
//! [`server::CompanionServer`] composition root that wires them to the
//! application layer.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `companion_core`, but MUST NOT be imported by them, except for the
//! in-memory transport used by unit tests.

pub mod network;
pub mod server;
pub mod storage;
