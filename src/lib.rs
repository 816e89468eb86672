//! # stream-protocol
//!
//! Layered transport and stream-filter protocol stack for carrying
//! application messages over TCP.
//!
//! ## Architecture
//!
//! Data flows bottom-up on receive and top-down on send, with each layer
//! optional per connection:
//!
//! ```text
//! application messages
//!        |
//!   [Bundle layer]        batching + request/reply correlation
//!        |
//!   [Encryption filter]   block cipher, plaintext chaining
//!        |
//!   [WebSocket filter]    RFC 6455 handshake + framing
//!        |
//!   [TcpChannel]          length-prefixed frames on a non-blocking socket
//! ```
//!
//! ## Components
//! - **core**: the frame wire format and the `Stream` capability set
//! - **transport**: the TCP channel, its reactor boundary and tokio
//!   drive helpers
//! - **filter**: encryption and WebSocket stream filters
//! - **protocol**: bundles, the bundle processor and reply tracking
//! - **config** / **error** / **utils**: the ambient stack
//!
//! ## Wire Format
//! ```text
//! [Length(2)] [Payload(N)]                 N < 0xFFFF
//! [0xFFFF(2)] [Length(4)] [Payload(N)]     N >= 0xFFFF
//! ```
//! The first frame from a connection initiator is the fixed preamble
//! `TCP\r\n\r\n`, validated byte-exact by the accepting side.
//!
//! ## Concurrency Model
//!
//! Single-threaded and reactor-driven: every filter-chain operation runs
//! on the event-loop thread, nothing blocks, and short or blocked writes
//! are queued and retried on writability notifications. Bytes within one
//! direction of a connection are processed strictly in arrival order.
//!
//! ## Example
//! ```rust,no_run
//! use std::cell::RefCell;
//! use std::rc::Rc;
//!
//! use stream_protocol::config::ChannelConfig;
//! use stream_protocol::error::Result;
//! use stream_protocol::protocol::{
//!     Bundle, IncomingMessage, InterfaceTable, LengthStyle, LengthWidth, MessageSpec,
//! };
//!
//! struct Echo;
//!
//! const ECHO: MessageSpec = MessageSpec {
//!     id: 0x01,
//!     name: "echo",
//!     length: LengthStyle::Variable(LengthWidth::Two),
//! };
//!
//! impl InterfaceTable for Echo {
//!     fn spec(&self, id: u8) -> Option<MessageSpec> {
//!         (id == ECHO.id).then_some(ECHO)
//!     }
//!
//!     fn handle(&mut self, message: IncomingMessage<'_>, replies: &mut Bundle) -> Result<()> {
//!         if let Some(reply_id) = message.reply_id {
//!             replies.start_reply(reply_id)?;
//!             replies.append(message.payload)?;
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<()> {
//!     stream_protocol::utils::logging::init_default();
//!     stream_protocol::transport::net::start_server(
//!         "127.0.0.1:7790",
//!         ChannelConfig::default(),
//!         || Rc::new(RefCell::new(Echo)),
//!         |_channel| Ok(()),
//!     )
//!     .await
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod filter;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use crate::config::{ChannelConfig, NetworkConfig};
pub use crate::core::{Stream, WriteMode};
pub use crate::error::{ProtocolError, Result};
pub use crate::filter::{
    AcceptAll, BlockCipher, EncryptionFilter, HandshakeHandler, WebSocketFilter,
};
pub use crate::protocol::{Bundle, InterfaceTable, MessageSpec, ReplyHandler, RequestTracker};
pub use crate::transport::{ChannelListener, DestroyReason, TcpChannel};
