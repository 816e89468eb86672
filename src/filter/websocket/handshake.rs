//! WebSocket handshake key material and acceptance policy.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};

use crate::error::{ProtocolError, Result};
use crate::filter::websocket::http::HttpRequest;

/// GUID appended to the client key before hashing, per RFC 6455 1.3.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Length of the decoded client nonce, per RFC 6455 4.1.
pub const KEY_NONCE_LENGTH: usize = 16;

/// Generates a fresh `Sec-WebSocket-Key` value: 16 random bytes, base64.
pub fn generate_key() -> Result<String> {
    let mut nonce = [0u8; KEY_NONCE_LENGTH];
    getrandom::fill(&mut nonce)
        .map_err(|e| ProtocolError::HandshakeError(format!("entropy source failed: {e}")))?;
    Ok(BASE64.encode(nonce))
}

/// Computes the `Sec-WebSocket-Accept` digest for a client key.
pub fn accept_digest(key_base64: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key_base64.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Validates that a received `Sec-WebSocket-Key` decodes to the required
/// 16-byte nonce.
pub fn validate_key(key_base64: &str) -> Result<()> {
    let decoded = BASE64.decode(key_base64).map_err(|_| {
        ProtocolError::HandshakeError("Sec-WebSocket-Key is not valid base64".into())
    })?;
    if decoded.len() != KEY_NONCE_LENGTH {
        return Err(ProtocolError::HandshakeError(format!(
            "Sec-WebSocket-Key decodes to {} bytes, expected {}",
            decoded.len(),
            KEY_NONCE_LENGTH
        )));
    }
    Ok(())
}

/// Splits a `Sec-WebSocket-Protocol` header into its subprotocol tokens.
pub fn parse_subprotocols(header: &str) -> Vec<String> {
    header
        .split(',')
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .collect()
}

/// Acceptance policy for incoming handshakes, injected into server-role
/// filters at creation time.
pub trait HandshakeHandler {
    /// Decides whether to accept the handshake. `subprotocols` arrives
    /// with the client's proposals and should be trimmed to the set the
    /// server agrees to speak; the negotiated set is echoed back in the
    /// response.
    fn should_accept_handshake(
        &mut self,
        request: &HttpRequest,
        subprotocols: &mut Vec<String>,
    ) -> bool;
}

/// Policy that accepts every handshake and all proposed subprotocols.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

impl HandshakeHandler for AcceptAll {
    fn should_accept_handshake(
        &mut self,
        _request: &HttpRequest,
        _subprotocols: &mut Vec<String>,
    ) -> bool {
        true
    }
}
