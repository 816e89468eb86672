//! Reply-Order tracking.
//!
//! Every outstanding request on a connection has an entry here mapping its
//! reply id to the pending handler and an optional deadline. Entries are
//! fulfilled when the correlated reply arrives, expired when their
//! deadline passes, and failed wholesale when the channel dies. Nothing in
//! this registry is shared across connections.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::ProtocolError;

/// Correlation id carried in a request message's reserved slot and echoed
/// at the start of the matching reply.
pub type ReplyId = u32;

/// Receives the outcome of one request.
pub trait ReplyHandler {
    /// Called with the reply payload when the correlated reply arrives.
    fn on_reply(&mut self, payload: Bytes);

    /// Called when the request can no longer be answered: timeout or
    /// channel teardown.
    fn on_failure(&mut self, error: &ProtocolError);
}

struct Pending {
    handler: Box<dyn ReplyHandler>,
    deadline: Option<Instant>,
}

/// The per-connection Reply-Order list.
#[derive(Default)]
pub struct RequestTracker {
    next_id: ReplyId,
    pending: HashMap<ReplyId, Pending>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Registers a pending request and returns the reply id to stamp into
    /// the outgoing message's correlation slot.
    pub fn register(
        &mut self,
        handler: Box<dyn ReplyHandler>,
        timeout: Option<Duration>,
    ) -> ReplyId {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let deadline = timeout.map(|t| Instant::now() + t);
        self.pending.insert(id, Pending { handler, deadline });
        id
    }

    /// Routes a reply payload to its pending handler.
    ///
    /// Returns `false` if no request with this id is outstanding, which a
    /// caller should treat as a peer bug worth logging, not a fatal error.
    pub fn fulfill(&mut self, id: ReplyId, payload: Bytes) -> bool {
        match self.pending.remove(&id) {
            Some(mut pending) => {
                debug!(reply_id = id, bytes = payload.len(), "Reply delivered");
                pending.handler.on_reply(payload);
                true
            }
            None => {
                warn!(reply_id = id, "Reply for unknown request id");
                false
            }
        }
    }

    /// Fails every pending request whose deadline has passed.
    ///
    /// Returns the number of requests expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<ReplyId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline.is_some_and(|d| d <= now))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(mut pending) = self.pending.remove(id) {
                warn!(reply_id = id, "Request timed out");
                pending.handler.on_failure(&ProtocolError::RequestTimeout);
            }
        }

        expired.len()
    }

    /// Fails every pending request, used when the owning channel dies.
    pub fn fail_all(&mut self, error: &ProtocolError) {
        for (id, mut pending) in self.pending.drain() {
            debug!(reply_id = id, %error, "Failing pending request");
            pending.handler.on_failure(error);
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    /// Handler double recording every outcome it sees.
    #[derive(Default)]
    pub struct RecordedOutcome {
        pub replies: Vec<Bytes>,
        pub failures: Vec<String>,
    }

    #[derive(Clone, Default)]
    pub struct RecordingHandler {
        pub outcome: Rc<RefCell<RecordedOutcome>>,
    }

    impl RecordingHandler {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl ReplyHandler for RecordingHandler {
        fn on_reply(&mut self, payload: Bytes) {
            self.outcome.borrow_mut().replies.push(payload);
        }

        fn on_failure(&mut self, error: &ProtocolError) {
            self.outcome.borrow_mut().failures.push(error.to_string());
        }
    }
}
