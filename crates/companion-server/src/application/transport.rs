//! Transport port: what the lifecycle logic needs from the network layer.
//!
//! Implementations run their I/O on background threads and queue
//! [`TransportEvent`]s.  The server drains that queue with
//! [`Transport::poll_event`] once per tick, so every method here must return
//! without blocking.

use std::fmt;
use std::net::SocketAddr;

use companion_core::{ConnectionRequestId, PeerHandle};
use thiserror::Error;

/// Error type for transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The listening sockets could not be bound.
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    /// No open connection exists for this peer handle.
    #[error("unknown peer: {0}")]
    UnknownPeer(PeerHandle),
    /// The peer stopped draining its outbound queue and was disconnected.
    #[error("send queue full for {0}")]
    SendQueueFull(PeerHandle),
    /// The connection request was already answered or never existed.
    #[error("unknown connection request: {0}")]
    UnknownRequest(ConnectionRequestId),
    /// The transport has not been started or was stopped.
    #[error("transport is not running")]
    NotRunning,
    /// An I/O error occurred while sending.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Kind of an unconnected datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnconnectedKind {
    /// A LAN broadcast probe from a client looking for servers.
    Broadcast,
    /// Any other unconnected datagram.
    Basic,
}

/// Why a peer went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The remote side closed the connection.
    RemoteClosed,
    /// The server asked the transport to disconnect the peer.
    LocalDisconnect,
    /// The connection failed with an I/O error.
    ConnectionReset,
    /// The transport is shutting down.
    ServerStopped,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::RemoteClosed => "remote closed",
            DisconnectReason::LocalDisconnect => "local disconnect",
            DisconnectReason::ConnectionReset => "connection reset",
            DisconnectReason::ServerStopped => "server stopped",
        };
        f.write_str(s)
    }
}

/// An event produced by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A client wants to connect.  Must be answered with
    /// [`Transport::accept`] or [`Transport::reject`].
    ConnectionRequest {
        request: ConnectionRequestId,
        remote: SocketAddr,
        payload: Vec<u8>,
    },
    /// A previously accepted peer is now connected.
    PeerConnected { peer: PeerHandle },
    /// A peer's connection closed.
    PeerDisconnected {
        peer: PeerHandle,
        reason: DisconnectReason,
    },
    /// A connected peer sent a payload on the reliable-ordered channel.
    DataReceived { peer: PeerHandle, payload: Vec<u8> },
    /// A datagram arrived from an address with no connection.
    UnconnectedMessage {
        remote: SocketAddr,
        kind: UnconnectedKind,
        payload: Vec<u8>,
    },
}

/// Trait abstracting the connection transport.
///
/// The production implementation is
/// [`SocketTransport`](crate::infrastructure::network::socket::SocketTransport);
/// tests use [`MemoryTransport`](crate::infrastructure::network::memory::MemoryTransport).
pub trait Transport: Send {
    /// Binds the listener on `port` with broadcast reception enabled and
    /// returns the port actually bound (`0` picks an ephemeral port).
    fn start(&mut self, port: u16) -> Result<u16, TransportError>;

    /// Closes every connection and releases the sockets.  Queued events are
    /// discarded.
    fn stop(&mut self);

    /// Pops the oldest queued event without waiting.
    fn poll_event(&mut self) -> Option<TransportEvent>;

    /// Accepts a pending connection request and returns the handle the peer
    /// will be known by.  [`TransportEvent::PeerConnected`] follows later.
    fn accept(&mut self, request: ConnectionRequestId) -> Result<PeerHandle, TransportError>;

    /// Rejects a pending connection request, delivering `payload` to the
    /// client if the transport supports it.
    fn reject(&mut self, request: ConnectionRequestId, payload: &[u8])
        -> Result<(), TransportError>;

    /// Queues `payload` on the peer's reliable-ordered channel.
    fn send_reliable_ordered(
        &mut self,
        peer: PeerHandle,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Sends an unconnected datagram to `remote`.
    fn send_unconnected(&mut self, remote: SocketAddr, payload: &[u8])
        -> Result<(), TransportError>;

    /// Forcibly closes the peer's connection.  Unknown peers are ignored.
    fn disconnect(&mut self, peer: PeerHandle);

    /// The bound port while running.
    fn local_port(&self) -> Option<u16>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_reason_display() {
        assert_eq!(DisconnectReason::RemoteClosed.to_string(), "remote closed");
        assert_eq!(DisconnectReason::ServerStopped.to_string(), "server stopped");
    }

    #[test]
    fn test_transport_error_messages_name_the_subject() {
        assert_eq!(
            TransportError::UnknownPeer(PeerHandle(9)).to_string(),
            "unknown peer: peer#9"
        );
        assert_eq!(
            TransportError::UnknownRequest(ConnectionRequestId(2)).to_string(),
            "unknown connection request: request#2"
        );
    }
}
