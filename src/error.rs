//! # Error Types
//!
//! Comprehensive error handling for the stream protocol stack.
//!
//! This module defines all error variants that can occur during protocol
//! operations, from low-level socket failures to WebSocket protocol
//! violations.
//!
//! ## Error Categories
//! - **I/O Errors**: Socket read/write failures and peer disconnects
//! - **Framing Errors**: Malformed length fields, oversized frames
//! - **Protocol Errors**: Handshake failures, illegal opcode sequencing
//! - **Cipher Errors**: Unkeyed or failing block cipher calls
//!
//! Retryable conditions (`WouldBlock`, short writes) are absorbed by the
//! transport layer and never surface as these errors; everything here is
//! connection-fatal for the channel that produced it.

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
/// Static strings are borrowed, avoiding heap allocations for common error cases.
pub mod constants {
    /// Framing errors
    pub const ERR_INVALID_PREAMBLE: &str = "Invalid connection preamble";
    pub const ERR_OVERSIZED_FRAME: &str = "Frame exceeds maximum length";

    /// Handshake errors
    pub const ERR_HANDSHAKE_TOO_LARGE: &str = "Handshake header exceeds maximum length";
    pub const ERR_BAD_ACCEPT_DIGEST: &str = "Sec-WebSocket-Accept digest mismatch";
    pub const ERR_HANDSHAKE_REJECTED: &str = "Handshake rejected by handler";

    /// Cipher errors
    pub const ERR_CIPHER_UNKEYED: &str = "Block cipher is not keyed";
    pub const ERR_BAD_BLOCK_SIZE: &str = "Data length is not a cipher block multiple";

    /// Bundle errors
    pub const ERR_BUNDLE_TRUNCATED: &str = "Bundle payload ended inside a message";
    pub const ERR_BAD_REQUEST_CHAIN: &str = "Request offset chain is corrupt";
}

/// The primary error type for all protocol operations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Invalid frame header")]
    InvalidHeader,

    #[error("Frame too large: {0} bytes")]
    OversizedFrame(usize),

    #[error("Invalid connection preamble")]
    InvalidPreamble,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("WebSocket protocol violation: {0}")]
    WebSocketViolation(String),

    #[error("Cipher error: {0}")]
    CipherError(String),

    #[error("Corrupt bundle: {0}")]
    CorruptBundle(String),

    #[error("Unknown message id: {0}")]
    UnknownMessage(u8),

    #[error("Request timed out")]
    RequestTimeout,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Whether this error came from a condition the transport retries on
    /// the next readiness event instead of tearing the channel down.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProtocolError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let would_block = ProtocolError::Io(io::Error::from(io::ErrorKind::WouldBlock));
        assert!(would_block.is_retryable());

        let reset = ProtocolError::Io(io::Error::from(io::ErrorKind::ConnectionReset));
        assert!(!reset.is_retryable());

        assert!(!ProtocolError::ConnectionClosed.is_retryable());
        assert!(!ProtocolError::InvalidPreamble.is_retryable());
    }
}
