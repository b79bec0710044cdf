//! Sessions: companion clients that have completed the handshake.
//!
//! # Lifecycle
//!
//! ```text
//! AwaitingHandshake  ──►  Connected  ──►  Disconnected
//! ```
//!
//! - `AwaitingHandshake`: the connect request passed validation and the
//!   transport accepted the peer, but has not reported it connected yet.
//! - `Connected`: the session is registered and visible to consumers.
//! - `Disconnected`: terminal.  A client that comes back gets a new peer
//!   handle and starts over in `AwaitingHandshake`.

use std::net::SocketAddr;
use std::time::SystemTime;

use crate::domain::peer::PeerHandle;

/// Handshake state of a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Connected,
    Disconnected,
}

/// A registered, handshake-completed companion client.
///
/// The session references its transport peer by handle only; closing the
/// connection is the transport's job.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub peer: PeerHandle,
    pub client_id: String,
    pub client_name: String,
    pub remote_address: SocketAddr,
    pub connected_at: SystemTime,
}

impl Session {
    pub fn new(
        peer: PeerHandle,
        client_id: impl Into<String>,
        client_name: impl Into<String>,
        remote_address: SocketAddr,
    ) -> Self {
        Self {
            peer,
            client_id: client_id.into(),
            client_name: client_name.into(),
            remote_address,
            connected_at: SystemTime::now(),
        }
    }
}
