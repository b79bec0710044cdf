//! Opaque identifiers issued by the transport layer.
//!
//! The server never holds the transport's native peer objects; it only keeps
//! these small integer handles and asks the transport to act on them.

use std::fmt;

/// Identifies one physical client connection for as long as it is open.
///
/// Handles are never reused by a transport instance, so a reconnecting client
/// always gets a fresh handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerHandle(pub u64);

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Identifies a connection attempt that has not been accepted or rejected yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionRequestId(pub u64);

impl fmt::Display for ConnectionRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "request#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_handle_display() {
        assert_eq!(PeerHandle(7).to_string(), "peer#7");
    }

    #[test]
    fn test_request_id_display() {
        assert_eq!(ConnectionRequestId(3).to_string(), "request#3");
    }
}
