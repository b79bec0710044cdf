//! CompanionServer: the composition root.
//!
//! Owns the transport and the [`SessionLifecycleController`] and exposes the
//! host-facing API.  The host calls [`CompanionServer::tick`] on a fixed
//! cadence; every protocol decision, registry mutation, and event publication
//! happens inside that call, on the caller's thread.
//!
//! ```text
//! transport threads ──► event queue ──► tick() ──► SessionLifecycleController
//!                                                    ├─ PeerRegistry
//!                                                    ├─ DiscoveryResponder
//!                                                    └─ ConnectionEventBus ──► subscribers
//! ```

use companion_core::{MicProfile, PeerHandle, Session, SessionState};
use thiserror::Error;
use tracing::{debug, info};

use crate::application::{
    collaborators::Collaborators,
    event_bus::{ConnectionEvent, ConnectionEventBus, SubscriptionId},
    session_lifecycle::SessionLifecycleController,
    transport::{Transport, TransportError, TransportEvent},
};

/// Errors returned by [`CompanionServer`] operations.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The transport could not bind its port.
    #[error("failed to start transport: {0}")]
    TransportBind(#[source] TransportError),

    #[error("server is already started")]
    AlreadyStarted,

    #[error("server is not running")]
    NotRunning,

    /// No live session has the given client id.
    #[error("no connected client with id {0:?}")]
    ClientNotFound(String),

    /// A send through the transport failed.
    #[error("transport error: {0}")]
    Transport(#[source] TransportError),
}

/// Companion connection server.
pub struct CompanionServer {
    transport: Box<dyn Transport>,
    lifecycle: SessionLifecycleController,
    running: bool,
}

impl CompanionServer {
    pub fn new(transport: Box<dyn Transport>, collaborators: Collaborators) -> Self {
        Self {
            transport,
            lifecycle: SessionLifecycleController::new(collaborators),
            running: false,
        }
    }

    /// Creates a server that requires `expected_version` in connect requests.
    pub fn with_protocol_version(
        transport: Box<dyn Transport>,
        collaborators: Collaborators,
        expected_version: i32,
    ) -> Self {
        Self {
            transport,
            lifecycle: SessionLifecycleController::with_protocol_version(
                collaborators,
                expected_version,
            ),
            running: false,
        }
    }

    /// Binds the transport on `port` (`0` picks an ephemeral port) and
    /// returns the bound port.
    ///
    /// # Errors
    ///
    /// - [`ServerError::AlreadyStarted`] if the server is running.
    /// - [`ServerError::TransportBind`] if the port cannot be bound.
    pub fn start(&mut self, port: u16) -> Result<u16, ServerError> {
        if self.running {
            return Err(ServerError::AlreadyStarted);
        }
        let bound = self
            .transport
            .start(port)
            .map_err(ServerError::TransportBind)?;
        self.running = true;
        info!("companion server started on port {bound}");
        Ok(bound)
    }

    /// Processes every transport event queued so far, in arrival order, and
    /// returns how many were processed.
    ///
    /// Events the transport queues while this batch is being handled (for
    /// example the `PeerConnected` that follows an accept) are processed by
    /// the next tick.  Never blocks; does nothing while stopped.
    pub fn tick(&mut self) -> usize {
        if !self.running {
            return 0;
        }
        let batch: Vec<TransportEvent> =
            std::iter::from_fn(|| self.transport.poll_event()).collect();
        let count = batch.len();
        for event in batch {
            self.lifecycle.handle_event(self.transport.as_mut(), event);
        }
        if count > 0 {
            debug!("tick processed {count} transport event(s)");
        }
        count
    }

    /// Snapshot of every connected session, ordered by peer handle.
    pub fn get_all_sessions(&self) -> Vec<Session> {
        self.lifecycle.registry().all()
    }

    pub fn find_by_client_id(&self, client_id: &str) -> Option<Session> {
        self.lifecycle.registry().lookup_by_client_id(client_id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.lifecycle.registry().len()
    }

    /// Handshake state of `peer` as seen by the server.
    pub fn state_of(&self, peer: PeerHandle) -> SessionState {
        self.lifecycle.state_of(peer)
    }

    /// Disconnects every client and returns how many sessions were removed.
    /// Each removal is published as `ConnectionChanged(false)`.
    pub fn disconnect_all(&mut self) -> usize {
        self.lifecycle.disconnect_all(self.transport.as_mut())
    }

    /// Disconnects every client and closes the transport.  Later ticks
    /// process nothing until [`CompanionServer::start`] is called again.
    pub fn stop(&mut self) {
        if !self.running {
            return;
        }
        self.lifecycle.disconnect_all(self.transport.as_mut());
        self.transport.stop();
        self.running = false;
        info!("companion server stopped");
    }

    /// Sends `payload` to the client with `client_id` on the reliable-ordered
    /// channel.
    ///
    /// # Errors
    ///
    /// - [`ServerError::NotRunning`] if the server is stopped.
    /// - [`ServerError::ClientNotFound`] if no session has that id.
    /// - [`ServerError::Transport`] if the transport send fails.
    pub fn send_to_client(&mut self, client_id: &str, payload: &str) -> Result<(), ServerError> {
        if !self.running {
            return Err(ServerError::NotRunning);
        }
        let peer = self
            .lifecycle
            .registry()
            .lookup_by_client_id(client_id)
            .map(|session| session.peer)
            .ok_or_else(|| ServerError::ClientNotFound(client_id.to_string()))?;
        self.transport
            .send_reliable_ordered(peer, payload.as_bytes())
            .map_err(ServerError::Transport)
    }

    /// Shorthand for `events_mut().subscribe(callback)`.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&ConnectionEvent) + Send + 'static,
    {
        self.lifecycle.events_mut().subscribe(callback)
    }

    pub fn events(&self) -> &ConnectionEventBus {
        self.lifecycle.events()
    }

    pub fn events_mut(&mut self) -> &mut ConnectionEventBus {
        self.lifecycle.events_mut()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Port the transport is bound to, if running.
    pub fn local_port(&self) -> Option<u16> {
        self.transport.local_port()
    }

    /// Current mic profiles, for persisting on shutdown.
    pub fn mic_profiles(&self) -> Vec<MicProfile> {
        self.lifecycle.mic_profiles()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use companion_core::protocol::{
        encode_message, CompanionMessage, ConnectRequest, PROTOCOL_VERSION,
    };

    use super::*;
    use crate::infrastructure::network::memory::MemoryTransport;

    fn remote() -> SocketAddr {
        "192.168.0.20:50000".parse().unwrap()
    }

    fn request_bytes(client_id: &str) -> Vec<u8> {
        encode_message(&CompanionMessage::ConnectRequest(ConnectRequest {
            protocol_version: PROTOCOL_VERSION,
            client_id: client_id.to_string(),
            client_name: "Phone".to_string(),
        }))
    }

    fn started_server() -> (CompanionServer, MemoryTransport) {
        let transport = MemoryTransport::new();
        let mut server = CompanionServer::new(Box::new(transport.clone()), Collaborators::default());
        server.start(0).unwrap();
        (server, transport)
    }

    #[test]
    fn test_server_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<CompanionServer>();
    }

    #[test]
    fn test_start_twice_returns_already_started() {
        let (mut server, _transport) = started_server();
        assert!(matches!(server.start(0), Err(ServerError::AlreadyStarted)));
    }

    #[test]
    fn test_start_bind_failure_leaves_server_stopped() {
        // Arrange
        let transport = MemoryTransport::new();
        transport.fail_next_bind();
        let mut server = CompanionServer::new(Box::new(transport), Collaborators::default());

        // Act
        let result = server.start(34567);

        // Assert
        assert!(matches!(result, Err(ServerError::TransportBind(_))));
        assert!(!server.is_running());
    }

    #[test]
    fn test_tick_before_start_processes_nothing() {
        let transport = MemoryTransport::new();
        let mut server = CompanionServer::new(Box::new(transport.clone()), Collaborators::default());
        transport.inject_probe(remote());

        assert_eq!(server.tick(), 0);
        assert_eq!(transport.queued_len(), 1);
    }

    #[test]
    fn test_handshake_completes_over_two_ticks() {
        // Arrange
        let (mut server, transport) = started_server();
        transport.inject_connection_request(remote(), request_bytes("abc"));

        // Act / Assert: first tick accepts, second tick sees PeerConnected
        assert_eq!(server.tick(), 1);
        assert_eq!(server.session_count(), 0);
        assert_eq!(server.tick(), 1);
        assert_eq!(server.session_count(), 1);
        assert_eq!(server.find_by_client_id("abc").unwrap().client_name, "Phone");
    }

    #[test]
    fn test_send_to_unknown_client_returns_client_not_found() {
        let (mut server, _transport) = started_server();
        assert!(matches!(
            server.send_to_client("nobody", "{}"),
            Err(ServerError::ClientNotFound(id)) if id == "nobody"
        ));
    }

    #[test]
    fn test_send_to_client_uses_reliable_channel() {
        let (mut server, transport) = started_server();
        let request = transport.inject_connection_request(remote(), request_bytes("abc"));
        server.tick();
        server.tick();
        let peer = transport.accepted_peer(request).unwrap();

        server.send_to_client("abc", "hello").unwrap();

        let sent = transport.reliable_sent_to(peer);
        assert_eq!(sent.last().unwrap(), b"hello");
    }

    #[test]
    fn test_stop_clears_sessions_and_halts_ticks() {
        // Arrange
        let (mut server, transport) = started_server();
        transport.inject_connection_request(remote(), request_bytes("abc"));
        server.tick();
        server.tick();

        // Act
        server.stop();
        transport.inject_probe(remote());

        // Assert
        assert!(!server.is_running());
        assert!(server.get_all_sessions().is_empty());
        assert_eq!(server.tick(), 0);
        assert!(matches!(
            server.send_to_client("abc", "x"),
            Err(ServerError::NotRunning)
        ));
    }

    #[test]
    fn test_server_can_restart_after_stop() {
        let (mut server, _transport) = started_server();
        server.stop();
        assert_eq!(server.start(5000).unwrap(), 5000);
        assert_eq!(server.local_port(), Some(5000));
    }
}
