//! Permissions and game modifiers advertised to companion clients in the
//! `ConnectResponse`.

use serde::{Deserialize, Serialize};

/// A capability the host grants to a companion client.
///
/// Serialized as the bare variant name, e.g. `"WriteSongQueue"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    ReadSongs,
    WriteSongQueue,
    ReadPlayers,
    WritePlayers,
    ReadConfig,
    WriteConfig,
    WriteInputSimulation,
    WriteMicrophone,
}

impl Permission {
    /// Every permission, in declaration order.
    pub const ALL: [Permission; 8] = [
        Permission::ReadSongs,
        Permission::WriteSongQueue,
        Permission::ReadPlayers,
        Permission::WritePlayers,
        Permission::ReadConfig,
        Permission::WriteConfig,
        Permission::WriteInputSimulation,
        Permission::WriteMicrophone,
    ];
}

/// A game modifier the client may offer to its user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifierDescriptor {
    pub id: String,
    pub display_name: String,
}

impl ModifierDescriptor {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}
