//! Protocol module containing the handshake message types and the JSON codec.

pub mod codec;
pub mod messages;

pub use codec::{
    decode_connect_request, decode_discovery_ack, decode_message, encode_discovery_ack,
    encode_message, ProtocolError,
};
pub use messages::*;
