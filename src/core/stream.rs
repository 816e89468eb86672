//! The stream capability set shared by every layer of a filter chain.
//!
//! A [`Stream`] is an abstract bidirectional byte channel. The transport
//! channel at the bottom of every chain implements it over a socket; each
//! filter implements it by transforming data on its way to and from the
//! stream directly beneath it. Filters exclusively own the stream they
//! wrap, so a chain is a straight line of `Box<dyn Stream>` decorators
//! with the channel holding only the head.
//!
//! Shutdown is cooperative and top-down: a filter that needs to run its
//! own closing protocol (such as the WebSocket close handshake) returns
//! `false` from [`Stream::did_finish_shutting_down`] and invokes
//! `shut_down` on the stream beneath it once that protocol completes.

use bytes::BytesMut;

use crate::error::Result;

/// Cork bit carried with every write.
///
/// Corked writes accumulate in the layer nearest the socket without a
/// syscall-level flush, letting several logical messages coalesce into one
/// segment; an uncorked write flushes all corked and new data immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Cork,
    Uncork,
}

impl WriteMode {
    pub fn is_corked(self) -> bool {
        matches!(self, WriteMode::Cork)
    }
}

/// Capability set for one direction-agnostic stream layer.
pub trait Stream {
    /// Writes all of `input` down the chain, draining it.
    ///
    /// # Errors
    /// Any error is connection-fatal; retryable socket conditions are
    /// absorbed below this interface.
    fn write_from(&mut self, input: &mut BytesMut, mode: WriteMode) -> Result<()>;

    /// Reads whatever is available from below, appends the transformed
    /// bytes to `output`, and returns the number appended.
    ///
    /// Zero is a normal result while a filter is mid-handshake or
    /// mid-frame; it does not signal disconnection.
    fn read_into(&mut self, output: &mut BytesMut) -> Result<usize>;

    /// Requests shutdown of this layer and everything beneath it.
    fn shut_down(&mut self);

    /// Whether this layer has completed its part of a shutdown.
    ///
    /// Returning `false` defers the shutdown; the layer promises to call
    /// `shut_down` on the stream beneath it when its closing protocol is
    /// done, so the request eventually reaches the transport channel.
    fn did_finish_shutting_down(&mut self) -> bool {
        true
    }

    /// Whether any bytes are still buffered waiting to go out.
    fn has_unsent_data(&self) -> bool {
        false
    }

    /// Whether the stream is still connected end to end.
    fn is_connected(&self) -> bool;

    /// Offers an inactivity timeout to this layer before default channel
    /// handling applies. Returns `true` if the timeout was consumed.
    fn did_handle_inactivity_timeout(&mut self) -> bool {
        false
    }

    /// A short description of this layer stacked over the layers below,
    /// for log messages.
    fn descriptor(&self) -> String;
}

/// Identity filter: forwards everything unchanged to the stream beneath.
///
/// Useful as a chain element in tests and as the no-transform variant of
/// the filter set.
pub struct PassThrough {
    inner: Box<dyn Stream>,
}

impl PassThrough {
    pub fn new(inner: Box<dyn Stream>) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> Box<dyn Stream> {
        self.inner
    }
}

impl Stream for PassThrough {
    fn write_from(&mut self, input: &mut BytesMut, mode: WriteMode) -> Result<()> {
        self.inner.write_from(input, mode)
    }

    fn read_into(&mut self, output: &mut BytesMut) -> Result<usize> {
        self.inner.read_into(output)
    }

    fn shut_down(&mut self) {
        self.inner.shut_down();
    }

    fn did_finish_shutting_down(&mut self) -> bool {
        self.inner.did_finish_shutting_down()
    }

    fn has_unsent_data(&self) -> bool {
        self.inner.has_unsent_data()
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn did_handle_inactivity_timeout(&mut self) -> bool {
        self.inner.did_handle_inactivity_timeout()
    }

    fn descriptor(&self) -> String {
        self.inner.descriptor()
    }
}
