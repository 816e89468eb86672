//! Chain-bottom stream over the channel internals.
//!
//! Filters own the stream beneath them, but the bottom of every chain is
//! the transport channel itself, which also owns the chain head. The
//! adaptor breaks that cycle: it holds only a weak back-reference to the
//! channel internals, which the channel clears when it is destroyed, so
//! a filter calling down after teardown sees a closed stream instead of
//! keeping the socket alive.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use bytes::BytesMut;

use crate::core::stream::{Stream, WriteMode};
use crate::error::{ProtocolError, Result};
use crate::transport::tcp::ChannelCore;

pub struct ChannelStreamAdaptor {
    core: Weak<RefCell<ChannelCore>>,
}

impl ChannelStreamAdaptor {
    pub(crate) fn new(core: &Rc<RefCell<ChannelCore>>) -> Self {
        Self {
            core: Rc::downgrade(core),
        }
    }

    fn core(&self) -> Result<Rc<RefCell<ChannelCore>>> {
        self.core.upgrade().ok_or(ProtocolError::ConnectionClosed)
    }
}

impl Stream for ChannelStreamAdaptor {
    fn write_from(&mut self, input: &mut BytesMut, mode: WriteMode) -> Result<()> {
        self.core()?.borrow_mut().write_from(input, mode)
    }

    fn read_into(&mut self, output: &mut BytesMut) -> Result<usize> {
        self.core()?.borrow_mut().read_into(output)
    }

    fn shut_down(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.borrow_mut().shut_down();
        }
    }

    fn has_unsent_data(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.borrow().has_unsent_data())
    }

    fn is_connected(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.borrow().is_connected())
    }

    fn descriptor(&self) -> String {
        match self.core.upgrade() {
            Some(core) => core.borrow().descriptor(),
            None => "tcp:<closed>".to_string(),
        }
    }
}
