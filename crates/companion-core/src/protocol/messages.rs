//! All companion handshake message types.
//!
//! Every message travels as a JSON object whose `"type"` field identifies the
//! variant; the remaining fields are camelCase and flattened into the same
//! object.  For example:
//!
//! ```json
//! {"type":"ConnectRequest","protocolVersion":1,"clientId":"a1b2","clientName":"Pixel 7"}
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::domain::permission::{ModifierDescriptor, Permission};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Protocol version the server speaks.  Clients announcing any other version
/// are rejected during the handshake.
pub const PROTOCOL_VERSION: i32 = 1;

/// Name given to clients that connect without a usable `clientName`.
pub const DEFAULT_CLIENT_NAME: &str = "Companion App";

/// Value carried by the unconnected discovery acknowledgement.
pub const DISCOVERY_ACK_SENTINEL: i32 = 1;

// ── Message type tags ─────────────────────────────────────────────────────────

/// All message type tags defined by the handshake protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    ConnectRequest,
    ConnectResponse,
    MicProfile,
    Error,
}

impl MessageType {
    /// Returns the string written into the `"type"` field on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::ConnectRequest => "ConnectRequest",
            MessageType::ConnectResponse => "ConnectResponse",
            MessageType::MicProfile => "MicProfile",
            MessageType::Error => "Error",
        }
    }
}

impl TryFrom<&str> for MessageType {
    type Error = ();

    fn try_from(value: &str) -> Result<Self, ()> {
        match value {
            "ConnectRequest" => Ok(MessageType::ConnectRequest),
            "ConnectResponse" => Ok(MessageType::ConnectResponse),
            "MicProfile" => Ok(MessageType::MicProfile),
            "Error" => Ok(MessageType::Error),
            _ => Err(()),
        }
    }
}

// ── Per-message payload structs ───────────────────────────────────────────────

/// Client → server: the payload of a transport connection attempt.
///
/// Untrusted.  Only reaches the rest of the server after
/// [`decode_connect_request`](crate::protocol::codec::decode_connect_request)
/// has validated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub protocol_version: i32,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_name: String,
}

/// Server → client: outcome of a handshake attempt.
///
/// A rejection carries only `error_message`; every other field is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub server_side_port: u16,
    #[serde(default)]
    pub permissions: BTreeSet<Permission>,
    #[serde(default)]
    pub available_modifiers: Vec<ModifierDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ConnectResponse {
    /// Builds a rejection response carrying only `message`.
    pub fn rejection(message: impl Into<String>) -> Self {
        Self {
            client_id: String::new(),
            client_name: String::new(),
            server_side_port: 0,
            permissions: BTreeSet::new(),
            available_modifiers: Vec::new(),
            error_message: Some(message.into()),
        }
    }

    /// `true` when this response rejects the connection attempt.
    pub fn is_rejection(&self) -> bool {
        self.error_message.is_some()
    }
}

/// Wire view of a microphone profile, as shown on the companion device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicProfileDescriptor {
    pub name: String,
    /// `#RRGGBB` hex string.
    pub color: String,
    pub is_enabled: bool,
    pub amplification: u8,
    pub noise_suppression: u8,
    pub delay_millis: u32,
}

/// Server → client: the microphone profile bound to the client's id.
/// Always sent right after a successful [`ConnectResponse`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicProfileMessage {
    pub profile: MicProfileDescriptor,
}

/// Either direction: a human-readable error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub error_message: String,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// Top-level enum wrapping every handshake message variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CompanionMessage {
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    MicProfile(MicProfileMessage),
    Error(ErrorMessage),
}

impl CompanionMessage {
    /// Returns the type tag for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            CompanionMessage::ConnectRequest(_) => MessageType::ConnectRequest,
            CompanionMessage::ConnectResponse(_) => MessageType::ConnectResponse,
            CompanionMessage::MicProfile(_) => MessageType::MicProfile,
            CompanionMessage::Error(_) => MessageType::Error,
        }
    }
}
