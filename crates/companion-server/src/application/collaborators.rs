//! Services the handshake consumes but does not own.
//!
//! The host application supplies real implementations (its permission
//! settings, its mic-profile storage, its UI).  The defaults in this module
//! are enough for the headless binary and for tests.

use std::collections::BTreeSet;

use companion_core::{MicProfile, ModifierDescriptor, Permission, Session};
use tracing::{debug, error};

/// Computes the permissions granted to a companion client.
#[cfg_attr(test, mockall::automock)]
pub trait PermissionProvider: Send {
    fn compute_permissions(&self, client_id: &str) -> BTreeSet<Permission>;
}

/// Lists the game modifiers companion clients may offer.
pub trait ModifierCatalog: Send {
    fn available_modifiers(&self) -> Vec<ModifierDescriptor>;
}

/// Storage for microphone profiles.
pub trait MicProfileStore: Send {
    /// Returns the profile bound to `client_id`, creating one named
    /// `client_name` with a fresh color if none exists.  The same id always
    /// resolves to the same profile.
    fn get_or_create(&mut self, client_id: &str, client_name: &str) -> MicProfile;

    /// Renames the profile bound to `client_id` and returns the updated
    /// profile, or `None` if no profile is bound to it.
    fn rename(&mut self, client_id: &str, name: &str) -> Option<MicProfile>;

    /// Snapshot of every stored profile.
    fn profiles(&self) -> Vec<MicProfile>;
}

/// Fire-and-forget user-facing error notification.
#[cfg_attr(test, mockall::automock)]
pub trait ErrorNotifier: Send {
    fn notify_error(&self, message: &str);
}

/// Interprets application messages from one connected companion client.
pub trait SessionMessageHandler: Send {
    fn handle_message(&mut self, session: &Session, payload: &str);
}

/// Creates the message handler for a newly registered session.
pub trait SessionHandlerFactory: Send {
    fn create_handler(&self, session: &Session) -> Box<dyn SessionMessageHandler>;
}

/// All collaborators, bundled for injection into the server.
pub struct Collaborators {
    pub permissions: Box<dyn PermissionProvider>,
    pub modifiers: Box<dyn ModifierCatalog>,
    pub mic_profiles: Box<dyn MicProfileStore>,
    pub notifier: Box<dyn ErrorNotifier>,
    pub handlers: Box<dyn SessionHandlerFactory>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            permissions: Box::new(ConfiguredPermissions::all()),
            modifiers: Box::new(StaticModifierCatalog::default()),
            mic_profiles: Box::new(InMemoryMicProfileStore::default()),
            notifier: Box::new(LogErrorNotifier),
            handlers: Box::new(LoggingHandlerFactory),
        }
    }
}

// ── Default implementations ───────────────────────────────────────────────────

/// Grants the same configured permission set to every client.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredPermissions {
    granted: BTreeSet<Permission>,
}

impl ConfiguredPermissions {
    pub fn new(granted: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            granted: granted.into_iter().collect(),
        }
    }

    pub fn all() -> Self {
        Self::new(Permission::ALL)
    }
}

impl PermissionProvider for ConfiguredPermissions {
    fn compute_permissions(&self, _client_id: &str) -> BTreeSet<Permission> {
        self.granted.clone()
    }
}

/// A fixed modifier list.
#[derive(Debug, Clone, Default)]
pub struct StaticModifierCatalog {
    modifiers: Vec<ModifierDescriptor>,
}

impl StaticModifierCatalog {
    pub fn new(modifiers: Vec<ModifierDescriptor>) -> Self {
        Self { modifiers }
    }
}

impl ModifierCatalog for StaticModifierCatalog {
    fn available_modifiers(&self) -> Vec<ModifierDescriptor> {
        self.modifiers.clone()
    }
}

/// Keeps profiles in a `Vec`; the binary seeds it from the config file and
/// writes it back on shutdown.
///
/// Lookup is a linear scan; a host has a handful of microphones.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMicProfileStore {
    profiles: Vec<MicProfile>,
}

impl InMemoryMicProfileStore {
    pub fn new(profiles: Vec<MicProfile>) -> Self {
        Self { profiles }
    }
}

impl MicProfileStore for InMemoryMicProfileStore {
    fn get_or_create(&mut self, client_id: &str, client_name: &str) -> MicProfile {
        if let Some(existing) = self.profiles.iter().find(|p| p.is_bound_to(client_id)) {
            return existing.clone();
        }
        let profile = MicProfile::for_companion(client_id, client_name);
        debug!(
            "created mic profile {:?} with color {} for companion {client_id}",
            profile.name, profile.color
        );
        self.profiles.push(profile.clone());
        profile
    }

    fn rename(&mut self, client_id: &str, name: &str) -> Option<MicProfile> {
        let profile = self.profiles.iter_mut().find(|p| p.is_bound_to(client_id))?;
        profile.name = name.to_string();
        Some(profile.clone())
    }

    fn profiles(&self) -> Vec<MicProfile> {
        self.profiles.clone()
    }
}

/// Reports errors through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorNotifier;

impl ErrorNotifier for LogErrorNotifier {
    fn notify_error(&self, message: &str) {
        error!("{message}");
    }
}

/// Creates handlers that only log what they receive.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandlerFactory;

impl SessionHandlerFactory for LoggingHandlerFactory {
    fn create_handler(&self, _session: &Session) -> Box<dyn SessionMessageHandler> {
        Box::new(LoggingHandler)
    }
}

struct LoggingHandler;

impl SessionMessageHandler for LoggingHandler {
    fn handle_message(&mut self, session: &Session, payload: &str) {
        debug!(
            "message from {} ({}): {payload}",
            session.client_name, session.client_id
        );
    }
}
