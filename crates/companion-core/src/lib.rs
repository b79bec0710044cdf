//! # companion-core
//!
//! Shared library for the companion connection server containing the
//! handshake protocol codec and the domain types that describe connected
//! companion clients.
//!
//! It has zero dependencies on OS APIs, sockets, or threads.
//!
//! # Architecture overview
//!
//! A companion client is a phone app that acts as a remote microphone or
//! controller for a host application on the same LAN.  The client finds the
//! host with a UDP broadcast probe, opens a connection carrying a
//! `ConnectRequest`, and, once accepted, receives a `ConnectResponse` followed
//! by the microphone profile bound to its client id.
//!
//! - **`protocol`** – The JSON messages exchanged during the handshake and
//!   the codec that validates untrusted input before anything else sees it.
//!
//! - **`domain`** – Peer handles, sessions, microphone profiles, and the
//!   permission/modifier vocabulary granted to clients.

pub mod domain;
pub mod protocol;

pub use domain::mic_profile::{MicProfile, RgbColor};
pub use domain::peer::{ConnectionRequestId, PeerHandle};
pub use domain::permission::{ModifierDescriptor, Permission};
pub use domain::session::{Session, SessionState};
pub use protocol::codec::{decode_message, encode_message, ProtocolError};
pub use protocol::messages::CompanionMessage;
