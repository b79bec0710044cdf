//! In-memory transport for unit and integration testing.
//!
//! Lets tests inject synthetic [`TransportEvent`]s and inspect everything the
//! server sent, without opening sockets.  The handle is cheap to clone: keep
//! one clone in the test and hand the other to the server.
//!
//! Accepting a request issues the next peer handle and, unless disabled with
//! [`MemoryTransport::set_auto_connect`], queues the matching
//! [`TransportEvent::PeerConnected`] like a real transport would.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use companion_core::{ConnectionRequestId, PeerHandle};

use crate::application::transport::{
    DisconnectReason, Transport, TransportError, TransportEvent, UnconnectedKind,
};

/// Port reported when started with port `0`.
pub const EPHEMERAL_PORT: u16 = 40_000;

#[derive(Default)]
struct MemoryState {
    port: Option<u16>,
    bind_failure: bool,
    auto_connect: bool,
    fail_unconnected_sends: bool,
    queue: VecDeque<TransportEvent>,
    next_request: u64,
    next_peer: u64,
    open_requests: HashSet<ConnectionRequestId>,
    open_peers: HashSet<PeerHandle>,
    accepted: HashMap<ConnectionRequestId, PeerHandle>,
    rejected: Vec<(ConnectionRequestId, Vec<u8>)>,
    reliable: Vec<(PeerHandle, Vec<u8>)>,
    unconnected: Vec<(SocketAddr, Vec<u8>)>,
    disconnected: Vec<PeerHandle>,
}

/// A [`Transport`] backed by an in-process queue.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let state = MemoryState {
            auto_connect: true,
            next_peer: 1,
            next_request: 1,
            ..MemoryState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next `start()` fail as if the port were already in use.
    pub fn fail_next_bind(&self) {
        self.state().bind_failure = true;
    }

    /// Controls whether `accept()` queues `PeerConnected` automatically.
    pub fn set_auto_connect(&self, enabled: bool) {
        self.state().auto_connect = enabled;
    }

    /// Makes `send_unconnected` fail until switched off again.
    pub fn fail_unconnected_sends(&self, enabled: bool) {
        self.state().fail_unconnected_sends = enabled;
    }

    /// Reserves a connection request id for an event the test builds itself.
    pub fn next_request_id(&self) -> ConnectionRequestId {
        let mut state = self.state();
        let id = ConnectionRequestId(state.next_request);
        state.next_request += 1;
        state.open_requests.insert(id);
        id
    }

    /// Queues an event as if it arrived from the network.
    pub fn inject(&self, event: TransportEvent) {
        let mut state = self.state();
        if let TransportEvent::ConnectionRequest { request, .. } = &event {
            state.open_requests.insert(*request);
        }
        state.queue.push_back(event);
    }

    /// Queues a connection request carrying `payload` and returns its id.
    pub fn inject_connection_request(
        &self,
        remote: SocketAddr,
        payload: impl Into<Vec<u8>>,
    ) -> ConnectionRequestId {
        let request = self.next_request_id();
        self.inject(TransportEvent::ConnectionRequest {
            request,
            remote,
            payload: payload.into(),
        });
        request
    }

    /// Queues a data payload from `peer`.
    pub fn inject_data(&self, peer: PeerHandle, payload: impl Into<Vec<u8>>) {
        self.inject(TransportEvent::DataReceived {
            peer,
            payload: payload.into(),
        });
    }

    /// Queues a remote disconnect of `peer`.
    pub fn inject_disconnect(&self, peer: PeerHandle) {
        self.state().open_peers.remove(&peer);
        self.inject(TransportEvent::PeerDisconnected {
            peer,
            reason: DisconnectReason::RemoteClosed,
        });
    }

    /// Queues a broadcast discovery probe from `remote`.
    pub fn inject_probe(&self, remote: SocketAddr) {
        self.inject(TransportEvent::UnconnectedMessage {
            remote,
            kind: UnconnectedKind::Broadcast,
            payload: Vec::new(),
        });
    }

    /// Peer handle issued when `request` was accepted.
    pub fn accepted_peer(&self, request: ConnectionRequestId) -> Option<PeerHandle> {
        self.state().accepted.get(&request).copied()
    }

    /// Every rejection with its payload, in order.
    pub fn rejected(&self) -> Vec<(ConnectionRequestId, Vec<u8>)> {
        self.state().rejected.clone()
    }

    /// Every reliable-ordered payload sent to `peer`, in order.
    pub fn reliable_sent_to(&self, peer: PeerHandle) -> Vec<Vec<u8>> {
        self.state()
            .reliable
            .iter()
            .filter(|(p, _)| *p == peer)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Total number of reliable-ordered payloads sent to any peer.
    pub fn reliable_sent_count(&self) -> usize {
        self.state().reliable.len()
    }

    /// Every unconnected datagram sent, in order.
    pub fn unconnected_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.state().unconnected.clone()
    }

    /// Peers the server asked to disconnect, in order.
    pub fn disconnected(&self) -> Vec<PeerHandle> {
        self.state().disconnected.clone()
    }

    /// Number of events still waiting to be polled.
    pub fn queued_len(&self) -> usize {
        self.state().queue.len()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for MemoryTransport {
    fn start(&mut self, port: u16) -> Result<u16, TransportError> {
        let mut state = self.state();
        if std::mem::take(&mut state.bind_failure) {
            return Err(TransportError::BindFailed {
                addr: SocketAddr::from(([0, 0, 0, 0], port)),
                source: io::Error::new(io::ErrorKind::AddrInUse, "address already in use"),
            });
        }
        let bound = if port == 0 { EPHEMERAL_PORT } else { port };
        state.port = Some(bound);
        Ok(bound)
    }

    fn stop(&mut self) {
        let mut state = self.state();
        state.port = None;
        state.queue.clear();
        state.open_requests.clear();
        let peers: Vec<PeerHandle> = state.open_peers.drain().collect();
        state.disconnected.extend(peers);
    }

    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.state().queue.pop_front()
    }

    fn accept(&mut self, request: ConnectionRequestId) -> Result<PeerHandle, TransportError> {
        let mut state = self.state();
        if !state.open_requests.remove(&request) {
            return Err(TransportError::UnknownRequest(request));
        }
        let peer = PeerHandle(state.next_peer);
        state.next_peer += 1;
        state.accepted.insert(request, peer);
        state.open_peers.insert(peer);
        if state.auto_connect {
            state.queue.push_back(TransportEvent::PeerConnected { peer });
        }
        Ok(peer)
    }

    fn reject(
        &mut self,
        request: ConnectionRequestId,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.open_requests.remove(&request) {
            return Err(TransportError::UnknownRequest(request));
        }
        state.rejected.push((request, payload.to_vec()));
        Ok(())
    }

    fn send_reliable_ordered(
        &mut self,
        peer: PeerHandle,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        if !state.open_peers.contains(&peer) {
            return Err(TransportError::UnknownPeer(peer));
        }
        state.reliable.push((peer, payload.to_vec()));
        Ok(())
    }

    fn send_unconnected(
        &mut self,
        remote: SocketAddr,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.port.is_none() {
            return Err(TransportError::NotRunning);
        }
        if state.fail_unconnected_sends {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::Other,
                "simulated send failure",
            )));
        }
        state.unconnected.push((remote, payload.to_vec()));
        Ok(())
    }

    fn disconnect(&mut self, peer: PeerHandle) {
        let mut state = self.state();
        if state.open_peers.remove(&peer) {
            state.disconnected.push(peer);
        }
    }

    fn local_port(&self) -> Option<u16> {
        self.state().port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote() -> SocketAddr {
        "10.1.1.1:9999".parse().unwrap()
    }

    #[test]
    fn test_start_with_port_zero_reports_ephemeral_port() {
        let mut transport = MemoryTransport::new();
        assert_eq!(transport.start(0).unwrap(), EPHEMERAL_PORT);
        assert_eq!(transport.local_port(), Some(EPHEMERAL_PORT));
    }

    #[test]
    fn test_fail_next_bind_fails_once() {
        let mut transport = MemoryTransport::new();
        transport.fail_next_bind();
        assert!(matches!(
            transport.start(5000),
            Err(TransportError::BindFailed { .. })
        ));
        assert!(transport.start(5000).is_ok());
    }

    #[test]
    fn test_events_are_polled_in_fifo_order() {
        let mut transport = MemoryTransport::new();
        transport.inject_probe(remote());
        transport.inject_data(PeerHandle(1), "x");

        assert!(matches!(
            transport.poll_event(),
            Some(TransportEvent::UnconnectedMessage { .. })
        ));
        assert!(matches!(
            transport.poll_event(),
            Some(TransportEvent::DataReceived { .. })
        ));
        assert!(transport.poll_event().is_none());
    }

    #[test]
    fn test_accept_issues_fresh_peer_and_queues_connected() {
        // Arrange
        let mut transport = MemoryTransport::new();
        let first = transport.inject_connection_request(remote(), "a");
        let second = transport.inject_connection_request(remote(), "b");
        transport.poll_event();
        transport.poll_event();

        // Act
        let a = transport.accept(first).unwrap();
        let b = transport.accept(second).unwrap();

        // Assert
        assert_ne!(a, b);
        assert_eq!(transport.accepted_peer(first), Some(a));
        assert_eq!(
            transport.poll_event(),
            Some(TransportEvent::PeerConnected { peer: a })
        );
    }

    #[test]
    fn test_request_can_only_be_answered_once() {
        let mut transport = MemoryTransport::new();
        let request = transport.inject_connection_request(remote(), "a");
        transport.reject(request, b"no").unwrap();
        assert!(matches!(
            transport.accept(request),
            Err(TransportError::UnknownRequest(_))
        ));
    }

    #[test]
    fn test_send_to_unknown_peer_fails() {
        let mut transport = MemoryTransport::new();
        assert!(matches!(
            transport.send_reliable_ordered(PeerHandle(5), b"x"),
            Err(TransportError::UnknownPeer(_))
        ));
    }

    #[test]
    fn test_auto_connect_can_be_disabled() {
        let mut transport = MemoryTransport::new();
        transport.set_auto_connect(false);
        let request = transport.next_request_id();
        transport.accept(request).unwrap();
        assert_eq!(transport.queued_len(), 0);
    }

    #[test]
    fn test_stop_clears_queue_and_closes_peers() {
        let mut transport = MemoryTransport::new();
        transport.start(0).unwrap();
        let request = transport.next_request_id();
        let peer = transport.accept(request).unwrap();

        transport.stop();

        assert_eq!(transport.queued_len(), 0);
        assert_eq!(transport.local_port(), None);
        assert_eq!(transport.disconnected(), vec![peer]);
    }
}
