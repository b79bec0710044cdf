//! Microphone profiles bound to companion clients.
//!
//! Profiles are owned by the host application's profile store.  The server
//! only reads them during the handshake and keeps the profile name in sync
//! with the name the companion client announces.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::messages::MicProfileDescriptor;

/// Amplification applied to newly created profiles.
pub const DEFAULT_AMPLIFICATION: u8 = 0;
/// Noise suppression applied to newly created profiles.
pub const DEFAULT_NOISE_SUPPRESSION: u8 = 5;
/// Companion audio arrives late over Wi-Fi; this is a reasonable first guess.
pub const DEFAULT_COMPANION_DELAY_MILLIS: u32 = 450;

/// A 24-bit RGB display color, serialized as `#RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RgbColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl RgbColor {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Returns a random, reasonably saturated color.
    ///
    /// The randomness comes from a v4 UUID.  Each channel is kept in
    /// `64..=255` so the color stays visible on a dark background.
    pub fn random() -> Self {
        let bytes = Uuid::new_v4().into_bytes();
        let channel = |b: u8| 64 + b % 192;
        Self::new(channel(bytes[0]), channel(bytes[1]), channel(bytes[2]))
    }

    pub fn to_hex(self) -> String {
        format!("#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }

    /// Parses `#RRGGBB` (the leading `#` is optional).
    pub fn from_hex(s: &str) -> Option<Self> {
        let hex = s.strip_prefix('#').unwrap_or(s);
        if hex.len() != 6 || !hex.is_ascii() {
            return None;
        }
        let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
        Some(Self::new(channel(0)?, channel(2)?, channel(4)?))
    }
}

impl fmt::Display for RgbColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for RgbColor {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        RgbColor::from_hex(&value).ok_or_else(|| format!("invalid color {value:?}"))
    }
}

impl From<RgbColor> for String {
    fn from(color: RgbColor) -> Self {
        color.to_hex()
    }
}

/// A microphone profile.
///
/// When `connected_client_id` is set, the profile belongs to the companion
/// client with that id and its `name` mirrors the client's announced name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MicProfile {
    pub name: String,
    pub color: RgbColor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected_client_id: Option<String>,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
    #[serde(default)]
    pub amplification: u8,
    #[serde(default = "default_noise_suppression")]
    pub noise_suppression: u8,
    #[serde(default)]
    pub delay_millis: u32,
}

fn default_enabled() -> bool {
    true
}
fn default_noise_suppression() -> u8 {
    DEFAULT_NOISE_SUPPRESSION
}

impl MicProfile {
    /// Creates a fresh profile for a companion client with a random color.
    pub fn for_companion(client_id: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            name: client_name.into(),
            color: RgbColor::random(),
            connected_client_id: Some(client_id.into()),
            is_enabled: true,
            amplification: DEFAULT_AMPLIFICATION,
            noise_suppression: DEFAULT_NOISE_SUPPRESSION,
            delay_millis: DEFAULT_COMPANION_DELAY_MILLIS,
        }
    }

    /// `true` if this profile is bound to the companion client `client_id`.
    pub fn is_bound_to(&self, client_id: &str) -> bool {
        self.connected_client_id.as_deref() == Some(client_id)
    }

    /// Wire representation sent in the `MicProfile` message.
    pub fn to_descriptor(&self) -> MicProfileDescriptor {
        MicProfileDescriptor {
            name: self.name.clone(),
            color: self.color.to_hex(),
            is_enabled: self.is_enabled,
            amplification: self.amplification,
            noise_suppression: self.noise_suppression,
            delay_millis: self.delay_millis,
        }
    }
}
