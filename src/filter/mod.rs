//! # Stream Filters
//!
//! Transforms that present the same [`Stream`](crate::core::Stream)
//! interface as the thing they wrap, so they compose into chains over a
//! transport channel.
//!
//! ## Components
//! - **Encryption**: Block-cipher filter with per-direction plaintext
//!   chaining registers
//! - **WebSocket**: Full RFC 6455 filter (handshake, framing, masking,
//!   close handshake)
//!
//! Filters stack in installation order: installing WebSocket and then
//! encryption puts the cipher nearest the application, carrying its
//! ciphertext inside WebSocket binary frames.

pub mod encryption;
pub mod websocket;

pub use encryption::{Aes128BlockCipher, BlockCipher, EncryptionFilter};
pub use websocket::{AcceptAll, HandshakeHandler, WebSocketFilter};
