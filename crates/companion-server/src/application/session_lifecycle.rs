//! SessionLifecycleController: the per-peer handshake state machine.
//!
//! ```text
//! ConnectionRequest ──validate──► accept ──► AwaitingHandshake ──PeerConnected──► Connected
//!        │                                          │                               │
//!        └──invalid──► reject(error payload)        └──PeerDisconnected──┐   PeerDisconnected
//!                                                                        ▼          ▼
//!                                                                     (dropped) Disconnected
//! ```
//!
//! Validation failures never leave this module: they become a rejection
//! payload for the client plus a log line.  Transport events that arrive out
//! of order (a peer connecting without an accepted request, data from an
//! unregistered peer) are logged and ignored.

use std::collections::HashMap;
use std::net::SocketAddr;

use companion_core::{
    encode_message,
    protocol::{
        decode_connect_request,
        messages::{ConnectRequest, ConnectResponse, MicProfileMessage, PROTOCOL_VERSION},
    },
    CompanionMessage, ConnectionRequestId, MicProfile, PeerHandle, ProtocolError, Session,
    SessionState,
};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::application::{
    collaborators::Collaborators,
    discovery::DiscoveryResponder,
    event_bus::{ConnectionEvent, ConnectionEventBus},
    peer_registry::PeerRegistry,
    transport::{DisconnectReason, Transport, TransportEvent, UnconnectedKind},
};

/// Why a connection request was turned away.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeRejection {
    #[error("Malformed connect request: {0}")]
    MalformedRequest(ProtocolError),

    #[error(
        "Unsupported protocol version {actual}; this server requires protocol version {expected}. \
         Please update the companion app or the host application."
    )]
    ProtocolVersionMismatch { expected: i32, actual: i32 },

    #[error("Connect request is missing a client id")]
    MissingClientId,
}

impl From<ProtocolError> for HandshakeRejection {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::MissingClientId => HandshakeRejection::MissingClientId,
            other => HandshakeRejection::MalformedRequest(other),
        }
    }
}

/// A validated request waiting for the transport to report its peer connected.
#[derive(Debug, Clone)]
struct PendingConnectRequest {
    request: ConnectRequest,
    remote: SocketAddr,
}

/// Drives every peer through the handshake and keeps the registry, the mic
/// profiles, and the event bus consistent with it.
pub struct SessionLifecycleController {
    expected_version: i32,
    pending: HashMap<PeerHandle, PendingConnectRequest>,
    registry: PeerRegistry,
    events: ConnectionEventBus,
    discovery: DiscoveryResponder,
    collaborators: Collaborators,
}

impl SessionLifecycleController {
    pub fn new(collaborators: Collaborators) -> Self {
        Self::with_protocol_version(collaborators, PROTOCOL_VERSION)
    }

    /// Creates a controller that requires `expected_version` from clients.
    pub fn with_protocol_version(collaborators: Collaborators, expected_version: i32) -> Self {
        Self {
            expected_version,
            pending: HashMap::new(),
            registry: PeerRegistry::new(),
            events: ConnectionEventBus::new(),
            discovery: DiscoveryResponder::new(),
            collaborators,
        }
    }

    /// Dispatches one transport event.
    pub fn handle_event(&mut self, transport: &mut dyn Transport, event: TransportEvent) {
        match event {
            TransportEvent::ConnectionRequest {
                request,
                remote,
                payload,
            } => self.on_connection_request(transport, request, remote, &payload),
            TransportEvent::PeerConnected { peer } => self.on_peer_connected(transport, peer),
            TransportEvent::PeerDisconnected { peer, reason } => {
                self.on_peer_disconnected(peer, reason)
            }
            TransportEvent::DataReceived { peer, payload } => self.on_data_received(peer, &payload),
            TransportEvent::UnconnectedMessage { remote, kind, .. } => {
                self.on_unconnected_message(transport, remote, kind)
            }
        }
    }

    /// Decodes and validates a raw connect request.
    ///
    /// # Errors
    ///
    /// Returns the [`HandshakeRejection`] describing the first problem found.
    pub fn validate(&self, raw: &[u8]) -> Result<ConnectRequest, HandshakeRejection> {
        let request = decode_connect_request(raw)?;
        if request.protocol_version != self.expected_version {
            return Err(HandshakeRejection::ProtocolVersionMismatch {
                expected: self.expected_version,
                actual: request.protocol_version,
            });
        }
        Ok(request)
    }

    fn on_connection_request(
        &mut self,
        transport: &mut dyn Transport,
        request_id: ConnectionRequestId,
        remote: SocketAddr,
        payload: &[u8],
    ) {
        let request = match self.validate(payload) {
            Ok(request) => request,
            Err(rejection) => {
                self.reject(transport, request_id, remote, &rejection);
                return;
            }
        };

        match transport.accept(request_id) {
            Ok(peer) => {
                debug!(
                    "accepted {request_id} from {remote} as {peer} (client {})",
                    request.client_id
                );
                self.pending
                    .insert(peer, PendingConnectRequest { request, remote });
            }
            Err(e) => warn!("failed to accept {request_id} from {remote}: {e}"),
        }
    }

    fn reject(
        &mut self,
        transport: &mut dyn Transport,
        request_id: ConnectionRequestId,
        remote: SocketAddr,
        rejection: &HandshakeRejection,
    ) {
        let message = rejection.to_string();
        warn!("rejected companion connection from {remote}: {message}");

        let response = CompanionMessage::ConnectResponse(ConnectResponse::rejection(&message));
        if let Err(e) = transport.reject(request_id, &encode_message(&response)) {
            warn!("failed to reject {request_id} from {remote}: {e}");
        }
        self.collaborators
            .notifier
            .notify_error(&format!("Companion app at {remote} could not connect: {message}"));
    }

    fn on_peer_connected(&mut self, transport: &mut dyn Transport, peer: PeerHandle) {
        let Some(PendingConnectRequest { request, remote }) = self.pending.remove(&peer) else {
            warn!("{peer} connected without an accepted connect request; ignoring");
            return;
        };

        let session = Session::new(peer, &request.client_id, &request.client_name, remote);
        let handler = self.collaborators.handlers.create_handler(&session);
        self.registry.register(session.clone(), handler);

        let permissions = self
            .collaborators
            .permissions
            .compute_permissions(&session.client_id);
        let available_modifiers = self.collaborators.modifiers.available_modifiers();
        let profile = self.sync_mic_profile(&session);

        let response = CompanionMessage::ConnectResponse(ConnectResponse {
            client_id: session.client_id.clone(),
            client_name: session.client_name.clone(),
            server_side_port: transport.local_port().unwrap_or(0),
            permissions,
            available_modifiers,
            error_message: None,
        });
        let profile_message = CompanionMessage::MicProfile(MicProfileMessage {
            profile: profile.to_descriptor(),
        });
        for message in [response, profile_message] {
            if let Err(e) = transport.send_reliable_ordered(peer, &encode_message(&message)) {
                warn!(
                    "failed to send {} to {peer}: {e}",
                    message.message_type().as_str()
                );
            }
        }

        info!(
            "companion {} ({}) connected from {remote} as {peer}",
            session.client_name, session.client_id
        );
        self.events.publish(&ConnectionEvent::ConnectionChanged {
            session,
            is_connected: true,
        });
    }

    /// Fetches the client's profile and corrects its name if the client
    /// announced a different one, publishing exactly one change event.
    fn sync_mic_profile(&mut self, session: &Session) -> MicProfile {
        let store = &mut self.collaborators.mic_profiles;
        let profile = store.get_or_create(&session.client_id, &session.client_name);
        if profile.name == session.client_name {
            return profile;
        }

        debug!(
            "renaming mic profile {:?} to {:?} for client {}",
            profile.name, session.client_name, session.client_id
        );
        let renamed = store
            .rename(&session.client_id, &session.client_name)
            .unwrap_or_else(|| MicProfile {
                name: session.client_name.clone(),
                ..profile
            });
        self.events.publish(&ConnectionEvent::MicProfileChanged {
            profile: renamed.clone(),
        });
        renamed
    }

    fn on_peer_disconnected(&mut self, peer: PeerHandle, reason: DisconnectReason) {
        if self.pending.remove(&peer).is_some() {
            debug!("{peer} disconnected before completing the handshake ({reason})");
        }
        let Some(session) = self.registry.unregister(peer) else {
            return;
        };
        info!(
            "companion {} ({}) disconnected: {reason}",
            session.client_name, session.client_id
        );
        self.events.publish(&ConnectionEvent::ConnectionChanged {
            session,
            is_connected: false,
        });
    }

    fn on_data_received(&mut self, peer: PeerHandle, payload: &[u8]) {
        if !self.registry.contains(peer) {
            warn!(
                "dropping {} byte(s) from unregistered {peer}",
                payload.len()
            );
            return;
        }
        match std::str::from_utf8(payload) {
            Ok(text) => {
                self.registry.route(peer, text);
            }
            Err(e) => warn!("dropping non UTF-8 message from {peer}: {e}"),
        }
    }

    fn on_unconnected_message(
        &mut self,
        transport: &mut dyn Transport,
        remote: SocketAddr,
        kind: UnconnectedKind,
    ) {
        match kind {
            UnconnectedKind::Broadcast => self.discovery.on_broadcast_probe(transport, remote),
            UnconnectedKind::Basic => trace!("ignoring unconnected message from {remote}"),
        }
    }

    /// Removes every session, asks the transport to close each peer, and
    /// publishes a disconnect event per removed session.  Pending handshakes
    /// are dropped too.  Returns the number of sessions removed.
    pub fn disconnect_all(&mut self, transport: &mut dyn Transport) -> usize {
        for peer in self.pending.drain().map(|(peer, _)| peer) {
            transport.disconnect(peer);
        }
        let sessions = self.registry.clear();
        let count = sessions.len();
        for session in sessions {
            transport.disconnect(session.peer);
            self.events.publish(&ConnectionEvent::ConnectionChanged {
                session,
                is_connected: false,
            });
        }
        if count > 0 {
            info!("disconnected {count} companion client(s)");
        }
        count
    }

    /// Handshake state of `peer`.  Peers the controller does not know about
    /// (never seen, rejected, or gone) are `Disconnected`.
    pub fn state_of(&self, peer: PeerHandle) -> SessionState {
        if self.registry.contains(peer) {
            SessionState::Connected
        } else if self.pending.contains_key(&peer) {
            SessionState::AwaitingHandshake
        } else {
            SessionState::Disconnected
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn events(&self) -> &ConnectionEventBus {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut ConnectionEventBus {
        &mut self.events
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn mic_profiles(&self) -> Vec<MicProfile> {
        self.collaborators.mic_profiles.profiles()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::{Arc, Mutex};

    use companion_core::{protocol::decode_message, Permission};

    use super::*;
    use crate::application::collaborators::{
        InMemoryMicProfileStore, MockErrorNotifier, MockPermissionProvider,
    };
    use crate::infrastructure::network::memory::MemoryTransport;

    const REMOTE: &str = "192.168.1.50:50123";

    fn request_payload(version: i32, client_id: &str, client_name: &str) -> Vec<u8> {
        format!(
            r#"{{"type":"ConnectRequest","protocolVersion":{version},"clientId":"{client_id}","clientName":"{client_name}"}}"#
        )
        .into_bytes()
    }

    fn started_transport() -> MemoryTransport {
        let mut transport = MemoryTransport::new();
        transport.start(34567).unwrap();
        transport
    }

    fn record_events(controller: &mut SessionLifecycleController) -> Arc<Mutex<Vec<ConnectionEvent>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        controller
            .events_mut()
            .subscribe(move |event| sink.lock().unwrap().push(event.clone()));
        log
    }

    /// Sends a connection request through the controller and returns the
    /// peer handle the transport assigned, if accepted.
    fn request(
        controller: &mut SessionLifecycleController,
        transport: &mut MemoryTransport,
        payload: Vec<u8>,
    ) -> Option<PeerHandle> {
        let request = transport.next_request_id();
        controller.handle_event(
            transport,
            TransportEvent::ConnectionRequest {
                request,
                remote: REMOTE.parse().unwrap(),
                payload,
            },
        );
        transport.accepted_peer(request)
    }

    #[test]
    fn test_valid_request_is_accepted_and_awaits_handshake() {
        // Arrange
        let mut controller = SessionLifecycleController::new(Collaborators::default());
        let mut transport = started_transport();

        // Act
        let peer = request(&mut controller, &mut transport, request_payload(1, "abc", "Pixel"))
            .expect("request must be accepted");

        // Assert
        assert_eq!(controller.state_of(peer), SessionState::AwaitingHandshake);
        assert!(controller.registry().is_empty(), "no half-open sessions");
    }

    #[test]
    fn test_peer_connected_completes_handshake() {
        // Arrange
        let mut controller = SessionLifecycleController::new(Collaborators::default());
        let mut transport = started_transport();
        let events = record_events(&mut controller);
        let peer =
            request(&mut controller, &mut transport, request_payload(1, "abc", "Pixel")).unwrap();

        // Act
        controller.handle_event(&mut transport, TransportEvent::PeerConnected { peer });

        // Assert
        assert_eq!(controller.state_of(peer), SessionState::Connected);
        assert_eq!(controller.pending_count(), 0);

        let sent = transport.reliable_sent_to(peer);
        assert_eq!(sent.len(), 2);
        match decode_message(&sent[0]).unwrap() {
            CompanionMessage::ConnectResponse(r) => {
                assert_eq!(r.client_id, "abc");
                assert_eq!(r.client_name, "Pixel");
                assert_eq!(r.server_side_port, 34567);
                assert!(r.error_message.is_none());
            }
            other => panic!("expected ConnectResponse first, got {other:?}"),
        }
        assert!(matches!(
            decode_message(&sent[1]).unwrap(),
            CompanionMessage::MicProfile(_)
        ));

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1, "new profile needs no rename");
        assert!(matches!(
            &events[0],
            ConnectionEvent::ConnectionChanged { is_connected: true, session } if session.client_id == "abc"
        ));
    }

    #[test]
    fn test_permissions_are_computed_for_the_connecting_client() {
        // Arrange
        let mut permissions = MockPermissionProvider::new();
        permissions
            .expect_compute_permissions()
            .withf(|client_id| client_id == "abc")
            .times(1)
            .return_const(BTreeSet::from([Permission::ReadSongs]));
        let collaborators = Collaborators {
            permissions: Box::new(permissions),
            ..Collaborators::default()
        };
        let mut controller = SessionLifecycleController::new(collaborators);
        let mut transport = started_transport();
        let peer =
            request(&mut controller, &mut transport, request_payload(1, "abc", "Pixel")).unwrap();

        // Act
        controller.handle_event(&mut transport, TransportEvent::PeerConnected { peer });

        // Assert
        let sent = transport.reliable_sent_to(peer);
        match decode_message(&sent[0]).unwrap() {
            CompanionMessage::ConnectResponse(r) => {
                assert_eq!(r.permissions, BTreeSet::from([Permission::ReadSongs]));
            }
            other => panic!("expected ConnectResponse first, got {other:?}"),
        }
    }

    #[test]
    fn test_version_mismatch_is_rejected_and_notified() {
        // Arrange
        let mut notifier = MockErrorNotifier::new();
        notifier
            .expect_notify_error()
            .withf(|message| message.contains("protocol version"))
            .times(1)
            .return_const(());
        let collaborators = Collaborators {
            notifier: Box::new(notifier),
            ..Collaborators::default()
        };
        let mut controller = SessionLifecycleController::new(collaborators);
        let mut transport = started_transport();

        // Act
        let peer = request(&mut controller, &mut transport, request_payload(99, "abc", "Pixel"));

        // Assert
        assert!(peer.is_none());
        assert_eq!(controller.pending_count(), 0);
        let rejected = transport.rejected();
        assert_eq!(rejected.len(), 1);
        match decode_message(&rejected[0].1).unwrap() {
            CompanionMessage::ConnectResponse(r) => {
                let message = r.error_message.expect("rejection carries a message");
                assert!(message.contains("protocol version"));
                assert!(r.client_id.is_empty());
            }
            other => panic!("expected ConnectResponse, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_classifies_rejections() {
        let controller = SessionLifecycleController::new(Collaborators::default());

        assert_eq!(
            controller.validate(br#"{"type":"ConnectRequest","protocolVersion":1,"clientId":""}"#),
            Err(HandshakeRejection::MissingClientId)
        );
        assert!(matches!(
            controller.validate(b"garbage"),
            Err(HandshakeRejection::MalformedRequest(_))
        ));
        assert_eq!(
            controller.validate(&request_payload(2, "abc", "x")),
            Err(HandshakeRejection::ProtocolVersionMismatch {
                expected: 1,
                actual: 2
            })
        );
    }

    #[test]
    fn test_custom_protocol_version_is_enforced() {
        let controller =
            SessionLifecycleController::with_protocol_version(Collaborators::default(), 7);
        assert!(controller.validate(&request_payload(7, "abc", "x")).is_ok());
        assert!(controller.validate(&request_payload(1, "abc", "x")).is_err());
    }

    #[test]
    fn test_orphan_peer_connected_is_ignored() {
        let mut controller = SessionLifecycleController::new(Collaborators::default());
        let mut transport = started_transport();
        let events = record_events(&mut controller);

        controller.handle_event(
            &mut transport,
            TransportEvent::PeerConnected {
                peer: PeerHandle(77),
            },
        );

        assert!(controller.registry().is_empty());
        assert!(events.lock().unwrap().is_empty());
        assert!(transport.reliable_sent_to(PeerHandle(77)).is_empty());
    }

    #[test]
    fn test_disconnect_before_handshake_drops_pending_silently() {
        let mut controller = SessionLifecycleController::new(Collaborators::default());
        let mut transport = started_transport();
        let events = record_events(&mut controller);
        let peer =
            request(&mut controller, &mut transport, request_payload(1, "abc", "Pixel")).unwrap();

        controller.handle_event(
            &mut transport,
            TransportEvent::PeerDisconnected {
                peer,
                reason: DisconnectReason::RemoteClosed,
            },
        );
        // A late PeerConnected must not resurrect the attempt.
        controller.handle_event(&mut transport, TransportEvent::PeerConnected { peer });

        assert_eq!(controller.state_of(peer), SessionState::Disconnected);
        assert!(controller.registry().is_empty());
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_existing_profile_is_renamed_once() {
        // Arrange
        let mut existing = MicProfile::for_companion("abc", "OldName");
        existing.delay_millis = 123;
        let collaborators = Collaborators {
            mic_profiles: Box::new(InMemoryMicProfileStore::new(vec![existing])),
            ..Collaborators::default()
        };
        let mut controller = SessionLifecycleController::new(collaborators);
        let mut transport = started_transport();
        let events = record_events(&mut controller);

        // Act
        let peer =
            request(&mut controller, &mut transport, request_payload(1, "abc", "NewName")).unwrap();
        controller.handle_event(&mut transport, TransportEvent::PeerConnected { peer });

        // Assert
        let profiles = controller.mic_profiles();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "NewName");
        assert_eq!(profiles[0].delay_millis, 123, "only the name changes");

        let events = events.lock().unwrap();
        let renames = events
            .iter()
            .filter(|e| matches!(e, ConnectionEvent::MicProfileChanged { .. }))
            .count();
        assert_eq!(renames, 1);
        assert!(matches!(events[0], ConnectionEvent::MicProfileChanged { .. }));
        assert!(matches!(
            events[1],
            ConnectionEvent::ConnectionChanged { is_connected: true, .. }
        ));
    }

    #[test]
    fn test_disconnect_all_closes_peers_and_publishes() {
        let mut controller = SessionLifecycleController::new(Collaborators::default());
        let mut transport = started_transport();
        let events = record_events(&mut controller);
        let a = request(&mut controller, &mut transport, request_payload(1, "a", "A")).unwrap();
        let b = request(&mut controller, &mut transport, request_payload(1, "b", "B")).unwrap();
        controller.handle_event(&mut transport, TransportEvent::PeerConnected { peer: a });

        let removed = controller.disconnect_all(&mut transport);

        assert_eq!(removed, 1);
        assert_eq!(controller.pending_count(), 0);
        assert!(controller.registry().is_empty());
        let closed = transport.disconnected();
        assert!(closed.contains(&a) && closed.contains(&b));
        let events = events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(ConnectionEvent::ConnectionChanged { is_connected: false, .. })
        ));
    }

    #[test]
    fn test_basic_unconnected_message_is_dropped() {
        let mut controller = SessionLifecycleController::new(Collaborators::default());
        let mut transport = started_transport();

        controller.handle_event(
            &mut transport,
            TransportEvent::UnconnectedMessage {
                remote: REMOTE.parse().unwrap(),
                kind: UnconnectedKind::Basic,
                payload: vec![1, 2, 3],
            },
        );

        assert!(transport.unconnected_sent().is_empty());
    }
}
