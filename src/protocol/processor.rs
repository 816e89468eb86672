//! Walking received bundle payloads.
//!
//! A [`BundleProcessor`] takes one complete frame payload and dispatches
//! its messages in order. Message ids resolve through an injected
//! [`InterfaceTable`]; reply messages are consumed internally and routed
//! to the connection's [`RequestTracker`]. The request chain embedded in
//! the payload is walked up front so request messages can surface their
//! correlation id without the processor guessing at layouts.

use std::collections::BTreeSet;

use bytes::Bytes;
use tracing::trace;

use crate::error::{constants, ProtocolError, Result};
use crate::protocol::bundle::{
    Bundle, LengthStyle, MessageId, MessageSpec, NO_REQUEST, REPLY_MESSAGE_ID,
};
use crate::protocol::requests::{ReplyId, RequestTracker};

/// One message surfaced to the application.
pub struct IncomingMessage<'a> {
    pub id: MessageId,
    pub name: &'static str,
    pub payload: &'a [u8],
    /// Correlation id to pass to [`Bundle::start_reply`], present when the
    /// peer sent this message as a request.
    pub reply_id: Option<ReplyId>,
}

/// The application's message table: wire specs plus dispatch.
///
/// Injected per channel; never a process-global registry.
pub trait InterfaceTable {
    /// Wire description for a message id, or `None` if unknown.
    fn spec(&self, id: MessageId) -> Option<MessageSpec>;

    /// Handles one received message. Replies may be appended to the
    /// provided bundle, which the channel sends with its next batch.
    fn handle(&mut self, message: IncomingMessage<'_>, replies: &mut Bundle) -> Result<()>;
}

/// Processor over one received frame payload.
pub struct BundleProcessor {
    data: Bytes,
}

impl BundleProcessor {
    pub fn new(frame: Bytes) -> Self {
        Self { data: frame }
    }

    /// Dispatches every message in the payload, in arrival order.
    ///
    /// # Errors
    /// Truncated messages, corrupt request chains and unknown ids abort
    /// processing of this frame; the caller decides whether that is fatal
    /// for the connection.
    pub fn dispatch(
        &self,
        table: &mut dyn InterfaceTable,
        requests: &mut RequestTracker,
        replies: &mut Bundle,
    ) -> Result<()> {
        if self.data.len() < 2 {
            return Err(ProtocolError::CorruptBundle(
                constants::ERR_BUNDLE_TRUNCATED.into(),
            ));
        }

        let head = u16::from_be_bytes([self.data[0], self.data[1]]);
        let request_offsets = self.walk_requests(table, head)?;

        let mut pos = 2;
        while pos < self.data.len() {
            let message_start = pos;
            let id = self.data[pos];
            pos += 1;

            if id == REPLY_MESSAGE_ID {
                pos = self.dispatch_reply(pos, requests)?;
                continue;
            }

            let spec = table
                .spec(id)
                .ok_or(ProtocolError::UnknownMessage(id))?;

            let mut payload_len = match spec.length {
                LengthStyle::Fixed(n) => n,
                LengthStyle::Variable(width) => {
                    self.need(pos, width.size())?;
                    let len = width.read(&self.data[pos..]);
                    pos += width.size();
                    len
                }
            };

            let is_request = request_offsets.contains(&message_start);
            let mut reply_id = None;
            if is_request {
                if matches!(spec.length, LengthStyle::Variable(_)) {
                    if payload_len < 6 {
                        return Err(ProtocolError::CorruptBundle(
                            constants::ERR_BAD_REQUEST_CHAIN.into(),
                        ));
                    }
                    payload_len -= 6;
                }
                self.need(pos, 6)?;
                reply_id = Some(u32::from_be_bytes([
                    self.data[pos],
                    self.data[pos + 1],
                    self.data[pos + 2],
                    self.data[pos + 3],
                ]));
                pos += 6; // correlation id + chain link
            }

            self.need(pos, payload_len)?;
            let payload = &self.data[pos..pos + payload_len];
            pos += payload_len;

            trace!(
                id,
                name = spec.name,
                bytes = payload.len(),
                request = is_request,
                "Dispatching message"
            );
            table.handle(
                IncomingMessage {
                    id,
                    name: spec.name,
                    payload,
                    reply_id,
                },
                replies,
            )?;
        }

        Ok(())
    }

    /// Routes a reply message to the pending request it answers.
    fn dispatch_reply(&self, mut pos: usize, requests: &mut RequestTracker) -> Result<usize> {
        self.need(pos, 4)?;
        let len = u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ]) as usize;
        pos += 4;
        if len < 4 {
            return Err(ProtocolError::CorruptBundle(
                constants::ERR_BUNDLE_TRUNCATED.into(),
            ));
        }
        self.need(pos, len)?;
        let reply_id = u32::from_be_bytes([
            self.data[pos],
            self.data[pos + 1],
            self.data[pos + 2],
            self.data[pos + 3],
        ]);
        let payload = self.data.slice(pos + 4..pos + len);
        requests.fulfill(reply_id, payload);
        Ok(pos + len)
    }

    /// Walks the request chain, returning the set of message offsets the
    /// peer flagged as requests.
    fn walk_requests(&self, table: &dyn InterfaceTable, head: u16) -> Result<BTreeSet<usize>> {
        let mut offsets = BTreeSet::new();
        let mut offset = head;
        let mut prev = 1usize;

        while offset != NO_REQUEST {
            let at = offset as usize;
            if at <= prev || at >= self.data.len() {
                return Err(ProtocolError::CorruptBundle(
                    constants::ERR_BAD_REQUEST_CHAIN.into(),
                ));
            }
            offsets.insert(at);

            let id = self.data[at];
            let spec = table
                .spec(id)
                .ok_or(ProtocolError::UnknownMessage(id))?;
            let field = match spec.length {
                LengthStyle::Fixed(_) => 0,
                LengthStyle::Variable(width) => width.size(),
            };
            let link_pos = at + 1 + field + 4;
            self.need(link_pos, 2)?;
            prev = at;
            offset = u16::from_be_bytes([self.data[link_pos], self.data[link_pos + 1]]);
        }

        Ok(offsets)
    }

    fn need(&self, pos: usize, len: usize) -> Result<()> {
        if pos + len > self.data.len() {
            return Err(ProtocolError::CorruptBundle(
                constants::ERR_BUNDLE_TRUNCATED.into(),
            ));
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingTable;
    use super::*;
    use crate::protocol::bundle::LengthWidth;
    use crate::protocol::requests::testing::RecordingHandler;

    fn specs() -> Vec<MessageSpec> {
        vec![
            MessageSpec {
                id: 0x01,
                name: "chat",
                length: LengthStyle::Variable(LengthWidth::Two),
            },
            MessageSpec {
                id: 0x02,
                name: "move",
                length: LengthStyle::Fixed(3),
            },
            MessageSpec {
                id: 0x03,
                name: "query",
                length: LengthStyle::Variable(LengthWidth::One),
            },
        ]
    }

    #[test]
    fn dispatches_messages_in_order() {
        let mut bundle = Bundle::new();
        let mut tracker = RequestTracker::new();
        let table_specs = specs();

        bundle.start_message(&table_specs[0]).unwrap();
        bundle.append(b"hello").unwrap();
        bundle.start_message(&table_specs[1]).unwrap();
        bundle.append(&[1, 2, 3]).unwrap();
        let payload = bundle.finalize(&mut tracker).unwrap().freeze();

        let mut table = RecordingTable::new(&table_specs);
        let mut replies = Bundle::new();
        BundleProcessor::new(payload)
            .dispatch(&mut table, &mut tracker, &mut replies)
            .unwrap();

        let seen = table.seen.borrow();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].id, 0x01);
        assert_eq!(seen[0].payload, b"hello");
        assert_eq!(seen[1].id, 0x02);
        assert_eq!(seen[1].payload, &[1, 2, 3]);
    }

    #[test]
    fn requests_surface_reply_ids_and_replies_correlate() {
        let table_specs = specs();
        let handler = RecordingHandler::new();

        // Requesting side builds a bundle with one request.
        let mut out = Bundle::new();
        let mut out_tracker = RequestTracker::new();
        out.start_request(&table_specs[2], Box::new(handler.clone()), None)
            .unwrap();
        out.append(b"ping").unwrap();
        let request_frame = out.finalize(&mut out_tracker).unwrap().freeze();
        assert_eq!(out_tracker.pending_count(), 1);

        // Answering side dispatches it and auto-replies.
        let mut table = RecordingTable::new(&table_specs).with_auto_reply();
        let mut in_tracker = RequestTracker::new();
        let mut replies = Bundle::new();
        BundleProcessor::new(request_frame)
            .dispatch(&mut table, &mut in_tracker, &mut replies)
            .unwrap();

        let seen = table.seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, b"ping");
        let reply_id = seen[0].reply_id.expect("request must carry a reply id");
        drop(seen);

        // Route the reply frame back through the requesting side.
        let reply_frame = replies.finalize(&mut in_tracker).unwrap().freeze();
        let mut empty_table = RecordingTable::new(&table_specs);
        let mut scratch = Bundle::new();
        BundleProcessor::new(reply_frame)
            .dispatch(&mut empty_table, &mut out_tracker, &mut scratch)
            .unwrap();

        assert_eq!(out_tracker.pending_count(), 0);
        let outcome = handler.outcome.borrow();
        assert_eq!(outcome.replies.len(), 1);
        assert_eq!(&outcome.replies[0][..], b"ping");
        assert_eq!(reply_id, 1);
    }

    #[test]
    fn walks_requests_past_unparsed_messages() {
        let table_specs = specs();
        let handler = RecordingHandler::new();

        let mut out = Bundle::new();
        let mut out_tracker = RequestTracker::new();
        out.start_message(&table_specs[0]).unwrap();
        out.append(b"filler").unwrap();
        out.start_request(&table_specs[2], Box::new(handler.clone()), None)
            .unwrap();
        out.append(b"q").unwrap();
        out.start_message(&table_specs[1]).unwrap();
        out.append(&[9, 9, 9]).unwrap();
        let frame = out.finalize(&mut out_tracker).unwrap().freeze();

        let mut table = RecordingTable::new(&table_specs);
        let mut in_tracker = RequestTracker::new();
        let mut replies = Bundle::new();
        BundleProcessor::new(frame)
            .dispatch(&mut table, &mut in_tracker, &mut replies)
            .unwrap();

        let seen = table.seen.borrow();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].reply_id.is_none());
        assert!(seen[1].reply_id.is_some());
        assert!(seen[2].reply_id.is_none());
    }

    #[test]
    fn unknown_id_aborts_frame() {
        let mut bundle = Bundle::new();
        let mut tracker = RequestTracker::new();
        bundle
            .start_message(&MessageSpec {
                id: 0x77,
                name: "mystery",
                length: LengthStyle::Fixed(0),
            })
            .unwrap();
        let frame = bundle.finalize(&mut tracker).unwrap().freeze();

        let mut table = RecordingTable::new(&specs());
        let mut replies = Bundle::new();
        let err = BundleProcessor::new(frame)
            .dispatch(&mut table, &mut tracker, &mut replies)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownMessage(0x77)));
    }

    #[test]
    fn corrupt_request_chain_rejected() {
        // Head offset pointing past the payload.
        let frame = Bytes::from_static(&[0x00, 0x30, 0x02, 1, 2, 3]);
        let mut table = RecordingTable::new(&specs());
        let mut tracker = RequestTracker::new();
        let mut replies = Bundle::new();
        let err = BundleProcessor::new(frame)
            .dispatch(&mut table, &mut tracker, &mut replies)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::CorruptBundle(_)));
    }

    #[test]
    fn truncated_message_rejected() {
        // Variable two-byte length claiming more than present.
        let frame = Bytes::from_static(&[0xFF, 0xFF, 0x01, 0x00, 0x10, b'x']);
        let mut table = RecordingTable::new(&specs());
        let mut tracker = RequestTracker::new();
        let mut replies = Bundle::new();
        let err = BundleProcessor::new(frame)
            .dispatch(&mut table, &mut tracker, &mut replies)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::CorruptBundle(_)));
    }
}
