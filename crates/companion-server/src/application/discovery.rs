//! DiscoveryResponder: answers LAN broadcast probes.
//!
//! # How discovery works
//!
//! 1. A companion app that does not know the host's address broadcasts a
//!    probe datagram to the LAN on the server port.
//! 2. The server answers each probe with a 4-byte unconnected ack carrying
//!    the sentinel integer `1`.  The ack holds no session data.
//! 3. The app collects the source addresses of the acks it receives and
//!    offers them as candidate servers, then opens a normal connection.
//!
//! Discovery is best effort: a failed send is logged and forgotten, and the
//! client simply probes again.

use std::net::SocketAddr;

use companion_core::protocol::encode_discovery_ack;
use tracing::{debug, warn};

use crate::application::transport::Transport;

/// Stateless responder for broadcast probes.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveryResponder;

impl DiscoveryResponder {
    pub fn new() -> Self {
        Self
    }

    /// Sends one discovery ack to `remote`.  Never fails.
    pub fn on_broadcast_probe(&self, transport: &mut dyn Transport, remote: SocketAddr) {
        debug!("discovery probe from {remote}");
        if let Err(e) = transport.send_unconnected(remote, &encode_discovery_ack()) {
            warn!("failed to send discovery ack to {remote}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::network::memory::MemoryTransport;
    use companion_core::protocol::decode_discovery_ack;

    #[test]
    fn test_probe_sends_single_sentinel_ack_to_prober() {
        // Arrange
        let mut transport = MemoryTransport::new();
        transport.start(0).unwrap();
        let remote: SocketAddr = "192.168.1.77:40000".parse().unwrap();

        // Act
        DiscoveryResponder::new().on_broadcast_probe(&mut transport, remote);

        // Assert
        let sent = transport.unconnected_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, remote);
        assert_eq!(decode_discovery_ack(&sent[0].1), Ok(1));
    }

    #[test]
    fn test_probe_swallows_send_failure() {
        let mut transport = MemoryTransport::new();
        transport.start(0).unwrap();
        transport.fail_unconnected_sends(true);

        DiscoveryResponder::new()
            .on_broadcast_probe(&mut transport, "192.168.1.77:40000".parse().unwrap());

        assert!(transport.unconnected_sent().is_empty());
    }
}
