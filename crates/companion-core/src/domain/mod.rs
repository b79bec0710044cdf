//! Domain types for the companion connection server.
//!
//! Pure data with no sockets or threads:
//!
//! - **`peer`** – opaque handles issued by the transport for connections and
//!   pending connection requests.
//! - **`session`** – a handshake-completed companion client and its lifecycle
//!   states.
//! - **`mic_profile`** – the microphone profile bound to a companion client.
//! - **`permission`** – permissions and game modifiers granted to clients.

pub mod mic_profile;
pub mod peer;
pub mod permission;
pub mod session;

pub use mic_profile::{MicProfile, RgbColor};
pub use peer::{ConnectionRequestId, PeerHandle};
pub use permission::{ModifierDescriptor, Permission};
pub use session::{Session, SessionState};
