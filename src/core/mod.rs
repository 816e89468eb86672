//! # Core Protocol Components
//!
//! Low-level framing and the stream capability set.
//!
//! This module provides the foundation for the protocol stack: the
//! length-prefixed transport frame wire format and the `Stream` trait that
//! every layer of a filter chain implements.
//!
//! ## Components
//! - **Frame**: Length-prefixed wire format with incremental decoding
//! - **Stream**: Bidirectional byte-channel capability set for filter stacking
//!
//! ## Wire Format
//! ```text
//! [Length(2)] [Payload(N)]                 N < 0xFFFF
//! [0xFFFF(2)] [Length(4)] [Payload(N)]     N >= 0xFFFF
//! ```
//!
//! ## Security
//! - Length validation before allocation (configurable maximum)
//! - The first frame from a connection initiator is a fixed preamble,
//!   validated byte-exact by the accepting side

pub mod frame;
pub mod stream;

pub use frame::{FrameCodec, FrameDecoder, PREAMBLE};
pub use stream::{Stream, WriteMode};
