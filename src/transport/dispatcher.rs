//! Reactor boundary.
//!
//! The event loop that owns the process delivers readability, writability
//! and timer notifications; it is consumed here, never reimplemented. A
//! channel registers write interest with its [`Dispatcher`] whenever a
//! short or blocked write leaves bytes queued, and cancels it once the
//! queue drains. The dispatcher is a strategy object injected at channel
//! creation, so embedders bring their own reactor (the tokio drive loop in
//! [`crate::transport::net`] is one such embedder).

use std::cell::Cell;
use std::rc::Rc;

/// Opaque per-channel token the embedding reactor uses to identify the
/// registration.
pub type ChannelToken = u64;

/// Write-interest registration surface of the embedding event loop.
pub trait Dispatcher {
    /// Asks the reactor to report writability for this channel's socket.
    fn register_write_interest(&self, token: ChannelToken);

    /// Cancels a previous write-interest registration.
    fn cancel_write_interest(&self, token: ChannelToken);
}

/// Dispatcher for embedders that poll `wants_write` themselves instead of
/// reacting to registrations.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDispatcher;

impl Dispatcher for NullDispatcher {
    fn register_write_interest(&self, _token: ChannelToken) {}

    fn cancel_write_interest(&self, _token: ChannelToken) {}
}

/// Single-channel dispatcher backed by a flag, used by the tokio drive
/// loop: registration raises the flag and the loop adds WRITABLE interest
/// to its next readiness await.
#[derive(Debug, Default)]
pub struct WriteInterestCell {
    wants_write: Cell<bool>,
}

impl WriteInterestCell {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn wants_write(&self) -> bool {
        self.wants_write.get()
    }
}

impl Dispatcher for WriteInterestCell {
    fn register_write_interest(&self, _token: ChannelToken) {
        self.wants_write.set(true);
    }

    fn cancel_write_interest(&self, _token: ChannelToken) {
        self.wants_write.set(false);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording dispatcher for channel unit tests.

    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[derive(Debug, Default)]
    pub struct RecordingDispatcher {
        pub events: RefCell<Vec<(&'static str, ChannelToken)>>,
    }

    impl RecordingDispatcher {
        pub fn new() -> Rc<Self> {
            Rc::new(Self::default())
        }

        pub fn registered(&self) -> usize {
            self.events
                .borrow()
                .iter()
                .filter(|(kind, _)| *kind == "register")
                .count()
        }

        pub fn cancelled(&self) -> usize {
            self.events
                .borrow()
                .iter()
                .filter(|(kind, _)| *kind == "cancel")
                .count()
        }
    }

    impl Dispatcher for RecordingDispatcher {
        fn register_write_interest(&self, token: ChannelToken) {
            self.events.borrow_mut().push(("register", token));
        }

        fn cancel_write_interest(&self, token: ChannelToken) {
            self.events.borrow_mut().push(("cancel", token));
        }
    }
}
