//! WebSocket opening handshake token (RFC 6455 section 1.3).

use base64::{engine::general_purpose, Engine as _};
use sha1::{Digest, Sha1};

use crate::error::ProtocolError;

pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Header prefix carrying the client's nonce.
pub const KEY_HEADER_PREFIX: &[u8] = b"Sec-WebSocket-Key: ";

/// `Sec-WebSocket-Accept` value for a client key.
pub fn derive_accept_token(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

/// Validate the value of a `Sec-WebSocket-Key` header.
///
/// The key must be the base64 encoding of a 16 byte nonce.
pub fn parse_client_key(value: &[u8]) -> Result<&str, ProtocolError> {
    let key = std::str::from_utf8(value)
        .map_err(|_| ProtocolError::MalformedWebSocketKey)?
        .trim();
    match general_purpose::STANDARD.decode(key) {
        Ok(nonce) if nonce.len() == 16 => Ok(key),
        _ => Err(ProtocolError::MalformedWebSocketKey),
    }
}
