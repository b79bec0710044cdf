//! PeerRegistry: the authoritative map from peer handle to session.
//!
//! A session is present here if and only if its peer is connected at the
//! transport layer and its handshake completed.  There is no half-open state
//! visible to consumers; pending handshakes live in the lifecycle controller.
//!
//! The registry is only touched from the poll-loop thread, so it carries no
//! lock of its own.  Anything that dispatches across threads must serialize
//! access to it.

use std::collections::HashMap;

use companion_core::{PeerHandle, Session};
use tracing::warn;

use crate::application::collaborators::SessionMessageHandler;

struct RegistryEntry {
    session: Session,
    handler: Box<dyn SessionMessageHandler>,
}

/// Registry of handshake-completed sessions.
#[derive(Default)]
pub struct PeerRegistry {
    entries: HashMap<PeerHandle, RegistryEntry>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session` under its peer handle together with the handler
    /// its application messages are routed to.
    ///
    /// An existing entry for the same handle is replaced and returned.
    pub fn register(
        &mut self,
        session: Session,
        handler: Box<dyn SessionMessageHandler>,
    ) -> Option<Session> {
        let peer = session.peer;
        let replaced = self
            .entries
            .insert(peer, RegistryEntry { session, handler })
            .map(|entry| entry.session);
        if let Some(ref old) = replaced {
            warn!(
                "{peer} re-registered; replaced session of client {}",
                old.client_id
            );
        }
        replaced
    }

    /// Removes and returns the session for `peer`.
    pub fn unregister(&mut self, peer: PeerHandle) -> Option<Session> {
        self.entries.remove(&peer).map(|entry| entry.session)
    }

    pub fn lookup(&self, peer: PeerHandle) -> Option<&Session> {
        self.entries.get(&peer).map(|entry| &entry.session)
    }

    /// Finds the session of the companion client `client_id`.
    ///
    /// If the same client is briefly connected twice (a reconnect racing the
    /// old connection's timeout) the newest peer handle wins.
    pub fn lookup_by_client_id(&self, client_id: &str) -> Option<&Session> {
        self.entries
            .values()
            .map(|entry| &entry.session)
            .filter(|session| session.client_id == client_id)
            .max_by_key(|session| session.peer)
    }

    pub fn contains(&self, peer: PeerHandle) -> bool {
        self.entries.contains_key(&peer)
    }

    /// Snapshot of every session, ordered by peer handle.
    pub fn all(&self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .entries
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by_key(|session| session.peer);
        sessions
    }

    /// Registered peer handles in ascending order.
    pub fn peers(&self) -> Vec<PeerHandle> {
        let mut peers: Vec<PeerHandle> = self.entries.keys().copied().collect();
        peers.sort();
        peers
    }

    /// Hands `payload` to the handler of `peer`'s session.
    ///
    /// Returns `false`, without calling anything, if `peer` is not
    /// registered.
    pub fn route(&mut self, peer: PeerHandle, payload: &str) -> bool {
        match self.entries.get_mut(&peer) {
            Some(entry) => {
                entry.handler.handle_message(&entry.session, payload);
                true
            }
            None => false,
        }
    }

    /// Removes every session and returns them ordered by peer handle.
    pub fn clear(&mut self) -> Vec<Session> {
        let mut sessions: Vec<Session> = self.entries.drain().map(|(_, e)| e.session).collect();
        sessions.sort_by_key(|session| session.peer);
        sessions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default, Clone)]
    struct RecordingHandler {
        received: Arc<Mutex<Vec<String>>>,
    }

    impl SessionMessageHandler for RecordingHandler {
        fn handle_message(&mut self, _session: &Session, payload: &str) {
            self.received.lock().unwrap().push(payload.to_string());
        }
    }

    fn make_session(peer: u64, client_id: &str) -> Session {
        Session::new(
            PeerHandle(peer),
            client_id,
            format!("name-{client_id}"),
            "10.0.0.2:5000".parse().unwrap(),
        )
    }

    fn register(registry: &mut PeerRegistry, peer: u64, client_id: &str) -> RecordingHandler {
        let handler = RecordingHandler::default();
        registry.register(make_session(peer, client_id), Box::new(handler.clone()));
        handler
    }

    #[test]
    fn test_registry_starts_empty() {
        let registry = PeerRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.all().is_empty());
    }

    #[test]
    fn test_register_then_lookup() {
        let mut registry = PeerRegistry::new();
        register(&mut registry, 1, "abc");

        let session = registry.lookup(PeerHandle(1)).expect("registered");
        assert_eq!(session.client_id, "abc");
        assert!(registry.contains(PeerHandle(1)));
    }

    #[test]
    fn test_register_same_peer_overwrites_and_returns_previous() {
        // Arrange
        let mut registry = PeerRegistry::new();
        register(&mut registry, 1, "abc");

        // Act
        let replaced = registry.register(
            make_session(1, "xyz"),
            Box::new(RecordingHandler::default()),
        );

        // Assert
        assert_eq!(replaced.map(|s| s.client_id), Some("abc".to_string()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(PeerHandle(1)).unwrap().client_id, "xyz");
    }

    #[test]
    fn test_unregister_returns_session_once() {
        let mut registry = PeerRegistry::new();
        register(&mut registry, 1, "abc");

        assert!(registry.unregister(PeerHandle(1)).is_some());
        assert!(registry.unregister(PeerHandle(1)).is_none());
        assert!(registry.lookup(PeerHandle(1)).is_none());
    }

    #[test]
    fn test_lookup_by_client_id_prefers_newest_peer() {
        let mut registry = PeerRegistry::new();
        register(&mut registry, 3, "abc");
        register(&mut registry, 7, "abc");
        register(&mut registry, 5, "xyz");

        assert_eq!(
            registry.lookup_by_client_id("abc").map(|s| s.peer),
            Some(PeerHandle(7))
        );
        assert!(registry.lookup_by_client_id("nobody").is_none());
    }

    #[test]
    fn test_all_is_a_snapshot_ordered_by_peer() {
        let mut registry = PeerRegistry::new();
        register(&mut registry, 9, "c");
        register(&mut registry, 2, "a");

        let snapshot = registry.all();
        registry.unregister(PeerHandle(2));

        let peers: Vec<_> = snapshot.iter().map(|s| s.peer).collect();
        assert_eq!(peers, vec![PeerHandle(2), PeerHandle(9)]);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_route_reaches_only_the_target_handler() {
        // Arrange
        let mut registry = PeerRegistry::new();
        let a = register(&mut registry, 1, "a");
        let b = register(&mut registry, 2, "b");

        // Act
        let routed = registry.route(PeerHandle(2), "hello");

        // Assert
        assert!(routed);
        assert!(a.received.lock().unwrap().is_empty());
        assert_eq!(*b.received.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_route_to_unknown_peer_returns_false() {
        let mut registry = PeerRegistry::new();
        let a = register(&mut registry, 1, "a");

        assert!(!registry.route(PeerHandle(42), "hello"));
        assert!(a.received.lock().unwrap().is_empty());
    }

    #[test]
    fn test_clear_drains_all_sessions() {
        let mut registry = PeerRegistry::new();
        register(&mut registry, 4, "a");
        register(&mut registry, 1, "b");

        let removed = registry.clear();

        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].peer, PeerHandle(1));
        assert!(registry.is_empty());
        assert!(registry.peers().is_empty());
    }
}
