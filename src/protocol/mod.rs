//! # Bundle Layer
//!
//! Batching of application messages into transport frame payloads, with
//! request/reply correlation.
//!
//! ## Components
//! - **Bundle**: Accumulates an ordered sequence of messages into one
//!   outgoing frame payload, chaining request messages so a receiver can
//!   walk them without parsing everything in between
//! - **Processor**: Walks a received frame payload in order, resolving
//!   message ids through an injected [`InterfaceTable`]
//! - **Requests**: The per-connection Reply-Order registry correlating
//!   outstanding request ids with pending handlers and timeouts
//!
//! Message ids and dispatch semantics belong to the application; this
//! layer only defines how messages are laid out inside a frame.

pub mod bundle;
pub mod processor;
pub mod requests;

pub use bundle::{Bundle, LengthStyle, LengthWidth, MessageId, MessageSpec, REPLY_MESSAGE_ID};
pub use processor::{BundleProcessor, IncomingMessage, InterfaceTable};
pub use requests::{ReplyHandler, ReplyId, RequestTracker};
