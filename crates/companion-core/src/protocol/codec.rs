//! JSON codec for encoding and decoding companion handshake messages.
//!
//! Wire format: one UTF-8 JSON object per transport payload, discriminated by
//! its `"type"` field.
//!
//! Decoding is the trust boundary of the server.  The discriminator is read
//! before any variant-specific parsing so that unknown or missing tags are
//! reported as [`ProtocolError::MalformedMessage`] rather than as a confusing
//! field-level error.

use serde_json::Value;
use thiserror::Error;
use tracing::trace;

use crate::protocol::messages::{
    CompanionMessage, ConnectRequest, MessageType, DEFAULT_CLIENT_NAME, DISCOVERY_ACK_SENTINEL,
};

/// Size of the encoded discovery acknowledgement in bytes.
pub const DISCOVERY_ACK_SIZE: usize = 4;

/// Errors that can occur while decoding a message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// The payload is not JSON, lacks a recognised `"type"` tag, or its
    /// fields do not match the tagged variant.
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// A `ConnectRequest` arrived without a usable `clientId`.
    #[error("connect request is missing a client id")]
    MissingClientId,

    /// The byte slice is shorter than the fixed-size payload it should hold.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },
}

/// Decodes one message from `raw`.
///
/// `ConnectRequest` payloads are normalised as well: `clientId` is trimmed and
/// must be non-empty, and an empty `clientName` is replaced by
/// [`DEFAULT_CLIENT_NAME`].
///
/// # Errors
///
/// - [`ProtocolError::MalformedMessage`] for invalid JSON, a missing or unknown
///   type tag, or fields that do not fit the tagged variant.
/// - [`ProtocolError::MissingClientId`] for a `ConnectRequest` whose client id
///   is empty.
pub fn decode_message(raw: &[u8]) -> Result<CompanionMessage, ProtocolError> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| ProtocolError::MalformedMessage(format!("invalid JSON: {e}")))?;

    let message_type = {
        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::MalformedMessage("missing message type".to_string()))?;
        MessageType::try_from(tag).map_err(|()| {
            ProtocolError::MalformedMessage(format!("unknown message type: {tag:?}"))
        })?
    };

    let message: CompanionMessage = serde_json::from_value(value).map_err(|e| {
        ProtocolError::MalformedMessage(format!(
            "invalid {} payload: {e}",
            message_type.as_str()
        ))
    })?;

    match message {
        CompanionMessage::ConnectRequest(request) => {
            normalize_connect_request(request).map(CompanionMessage::ConnectRequest)
        }
        other => Ok(other),
    }
}

/// Decodes `raw` and requires it to be a `ConnectRequest`.
///
/// # Errors
///
/// Everything [`decode_message`] returns, plus
/// [`ProtocolError::MalformedMessage`] when the payload is a different
/// (well-formed) message type.
pub fn decode_connect_request(raw: &[u8]) -> Result<ConnectRequest, ProtocolError> {
    match decode_message(raw)? {
        CompanionMessage::ConnectRequest(request) => Ok(request),
        other => Err(ProtocolError::MalformedMessage(format!(
            "expected ConnectRequest, got {}",
            other.message_type().as_str()
        ))),
    }
}

/// Encodes `message` as a JSON object with a `"type"` tag.
pub fn encode_message(message: &CompanionMessage) -> Vec<u8> {
    // Every variant is made of strings, integers, booleans, and sequences of
    // those, none of which serde_json can fail on.
    serde_json::to_vec(message).expect("companion messages always serialize to JSON")
}

/// Encodes the unconnected discovery acknowledgement: the sentinel integer
/// as 4 big-endian bytes.
pub fn encode_discovery_ack() -> [u8; DISCOVERY_ACK_SIZE] {
    DISCOVERY_ACK_SENTINEL.to_be_bytes()
}

/// Reads the integer carried by a discovery acknowledgement.
///
/// # Errors
///
/// Returns [`ProtocolError::InsufficientData`] if `raw` is shorter than
/// [`DISCOVERY_ACK_SIZE`].
pub fn decode_discovery_ack(raw: &[u8]) -> Result<i32, ProtocolError> {
    let bytes: [u8; DISCOVERY_ACK_SIZE] = raw
        .get(..DISCOVERY_ACK_SIZE)
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtocolError::InsufficientData {
            needed: DISCOVERY_ACK_SIZE,
            available: raw.len(),
        })?;
    Ok(i32::from_be_bytes(bytes))
}

fn normalize_connect_request(mut request: ConnectRequest) -> Result<ConnectRequest, ProtocolError> {
    let client_id = request.client_id.trim();
    if client_id.is_empty() {
        return Err(ProtocolError::MissingClientId);
    }
    request.client_id = client_id.to_string();

    let client_name = request.client_name.trim();
    request.client_name = if client_name.is_empty() {
        trace!("client {} sent no name, using {DEFAULT_CLIENT_NAME:?}", request.client_id);
        DEFAULT_CLIENT_NAME.to_string()
    } else {
        client_name.to_string()
    };
    Ok(request)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
