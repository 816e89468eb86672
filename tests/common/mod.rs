//! Shared fixtures for the integration suites.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use stream_protocol::error::{ProtocolError, Result};
use stream_protocol::protocol::{
    Bundle, IncomingMessage, InterfaceTable, LengthStyle, LengthWidth, MessageSpec, ReplyHandler,
};

pub const CHAT: MessageSpec = MessageSpec {
    id: 0x01,
    name: "chat",
    length: LengthStyle::Variable(LengthWidth::Two),
};

pub const QUERY: MessageSpec = MessageSpec {
    id: 0x02,
    name: "query",
    length: LengthStyle::Variable(LengthWidth::One),
};

/// Records every message it sees and answers requests by echoing the
/// payload back.
#[derive(Clone, Default)]
pub struct EchoTable {
    pub seen: Rc<RefCell<Vec<(u8, Vec<u8>)>>>,
}

impl InterfaceTable for EchoTable {
    fn spec(&self, id: u8) -> Option<MessageSpec> {
        match id {
            0x01 => Some(CHAT),
            0x02 => Some(QUERY),
            _ => None,
        }
    }

    fn handle(&mut self, message: IncomingMessage<'_>, replies: &mut Bundle) -> Result<()> {
        self.seen
            .borrow_mut()
            .push((message.id, message.payload.to_vec()));
        if let Some(reply_id) = message.reply_id {
            replies.start_reply(reply_id)?;
            replies.append(message.payload)?;
        }
        Ok(())
    }
}

/// Reply handler collecting outcomes for assertions.
#[derive(Clone, Default)]
pub struct CollectingHandler {
    pub replies: Rc<RefCell<Vec<Bytes>>>,
    pub failures: Rc<RefCell<Vec<String>>>,
}

impl ReplyHandler for CollectingHandler {
    fn on_reply(&mut self, payload: Bytes) {
        self.replies.borrow_mut().push(payload);
    }

    fn on_failure(&mut self, error: &ProtocolError) {
        self.failures.borrow_mut().push(error.to_string());
    }
}
