//! Application layer of the companion server.
//!
//! Everything here runs on the single poll-loop thread and talks to the
//! network only through the [`transport::Transport`] trait, so it can be unit
//! tested with the in-memory transport.
//!
//! # Sub-modules
//!
//! - **`transport`** – The port the lifecycle logic drives: transport events
//!   and the accept/reject/send primitives.
//!
//! - **`collaborators`** – Traits for the services the handshake consumes
//!   (permissions, modifiers, mic profiles, error notification, per-session
//!   message handlers) plus simple default implementations.
//!
//! - **`peer_registry`** – The authoritative map from peer handle to session.
//!
//! - **`event_bus`** – Synchronous publish/subscribe point for connection and
//!   mic-profile changes.
//!
//! - **`discovery`** – Answers broadcast probes with an unconnected ack.
//!
//! - **`session_lifecycle`** – The handshake state machine tying the above
//!   together.

pub mod collaborators;
pub mod discovery;
pub mod event_bus;
pub mod peer_registry;
pub mod session_lifecycle;
pub mod transport;
