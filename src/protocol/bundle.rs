//! Outgoing message bundles.
//!
//! A [`Bundle`] accumulates an ordered sequence of application messages
//! destined for one transport frame. Each message starts with its id and,
//! for variable-length message kinds, a length field that is patched in
//! place once the message is finalized (when the next message starts or
//! the bundle is sent).
//!
//! Request messages additionally reserve a 4-byte reply-correlation slot
//! (stamped at send time from the connection's [`RequestTracker`]) and a
//! 2-byte next-request offset chained from the previous request, so a
//! receiver can walk every request in the frame without parsing the
//! messages in between. The chain head lives in the first two bytes of
//! the bundle payload.
//!
//! ## Payload layout
//! ```text
//! [HeadRequestOffset(2)] [Message]*
//! Message  = [Id(1)] [Length(0|1|2|4)] [ReplyId(4) NextRequest(2)]? [Data]
//! ```

use std::time::Duration;

use bytes::{BufMut, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::protocol::requests::{ReplyHandler, ReplyId, RequestTracker};

/// Application message identifier.
pub type MessageId = u8;

/// Reserved id for reply messages; never usable by application tables.
pub const REPLY_MESSAGE_ID: MessageId = 0xFF;

/// Sentinel offset terminating the request chain.
pub const NO_REQUEST: u16 = 0xFFFF;

/// Width of a variable-length message's length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthWidth {
    One,
    Two,
    Four,
}

impl LengthWidth {
    pub fn size(self) -> usize {
        match self {
            LengthWidth::One => 1,
            LengthWidth::Two => 2,
            LengthWidth::Four => 4,
        }
    }

    pub fn max_value(self) -> usize {
        match self {
            LengthWidth::One => u8::MAX as usize,
            LengthWidth::Two => u16::MAX as usize,
            LengthWidth::Four => u32::MAX as usize,
        }
    }

    fn write(self, value: usize, slot: &mut [u8]) {
        match self {
            LengthWidth::One => slot[0] = value as u8,
            LengthWidth::Two => slot.copy_from_slice(&(value as u16).to_be_bytes()),
            LengthWidth::Four => slot.copy_from_slice(&(value as u32).to_be_bytes()),
        }
    }

    pub(crate) fn read(self, data: &[u8]) -> usize {
        match self {
            LengthWidth::One => data[0] as usize,
            LengthWidth::Two => u16::from_be_bytes([data[0], data[1]]) as usize,
            LengthWidth::Four => u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize,
        }
    }
}

/// How a message kind's payload length is carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthStyle {
    /// Payload is always exactly this many bytes; no length field.
    Fixed(usize),
    /// Length field of the given width precedes the message data.
    Variable(LengthWidth),
}

/// Wire description of one message kind, resolved through the
/// application's interface table.
#[derive(Debug, Clone, Copy)]
pub struct MessageSpec {
    pub id: MessageId,
    pub name: &'static str,
    pub length: LengthStyle,
}

impl MessageSpec {
    pub(crate) fn reply() -> Self {
        Self {
            id: REPLY_MESSAGE_ID,
            name: "reply",
            length: LengthStyle::Variable(LengthWidth::Four),
        }
    }
}

struct OpenMessage {
    name: &'static str,
    length: LengthStyle,
    /// Position of the length field, for variable-length messages.
    length_field_pos: Option<usize>,
    /// First byte after the length field; request slots count as data.
    data_start: usize,
    is_request: bool,
}

struct ReplyOrder {
    handler: Box<dyn ReplyHandler>,
    timeout: Option<Duration>,
    /// Position of the 4-byte reply-id slot to stamp at send time.
    reply_id_pos: usize,
}

/// An ordered batch of messages packed into one frame payload.
///
/// Created fresh per outgoing batch; [`Bundle::finalize`] drains it for
/// sending and resets it.
pub struct Bundle {
    data: BytesMut,
    num_messages: usize,
    current: Option<OpenMessage>,
    reply_orders: Vec<ReplyOrder>,
    /// Position of the previous request's next-offset slot.
    last_request_link: Option<usize>,
}

impl Default for Bundle {
    fn default() -> Self {
        Self::new()
    }
}

impl Bundle {
    pub fn new() -> Self {
        let mut data = BytesMut::with_capacity(256);
        data.put_u16(NO_REQUEST);
        Self {
            data,
            num_messages: 0,
            current: None,
            reply_orders: Vec::new(),
            last_request_link: None,
        }
    }

    pub fn num_messages(&self) -> usize {
        self.num_messages + usize::from(self.current.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.num_messages() == 0
    }

    /// Current payload size, including any message still being streamed.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Starts a new plain message, finalizing any message in progress.
    pub fn start_message(&mut self, spec: &MessageSpec) -> Result<()> {
        if spec.id == REPLY_MESSAGE_ID {
            return Err(ProtocolError::Custom(
                "message id 0xFF is reserved for replies".into(),
            ));
        }
        self.end_message()?;
        self.begin(spec, false);
        Ok(())
    }

    /// Starts a new request message, finalizing any message in progress.
    ///
    /// The handler is invoked when the correlated reply arrives, or fails
    /// on timeout or channel death. The reply id is assigned and stamped
    /// when the bundle is sent.
    pub fn start_request(
        &mut self,
        spec: &MessageSpec,
        handler: Box<dyn ReplyHandler>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if spec.id == REPLY_MESSAGE_ID {
            return Err(ProtocolError::Custom(
                "message id 0xFF is reserved for replies".into(),
            ));
        }
        self.end_message()?;

        let start = self.data.len();
        if start >= NO_REQUEST as usize {
            return Err(ProtocolError::CorruptBundle(
                "request offset exceeds chain range".into(),
            ));
        }

        self.begin(spec, true);

        // Reserve the correlation slot and the chain link.
        let reply_id_pos = self.data.len();
        self.data.put_u32(0);
        let link_pos = self.data.len();
        self.data.put_u16(NO_REQUEST);

        // Chain this request from the previous one, or from the head.
        match self.last_request_link.take() {
            Some(prev_link) => {
                self.data[prev_link..prev_link + 2].copy_from_slice(&(start as u16).to_be_bytes());
            }
            None => {
                self.data[0..2].copy_from_slice(&(start as u16).to_be_bytes());
            }
        }
        self.last_request_link = Some(link_pos);

        self.reply_orders.push(ReplyOrder {
            handler,
            timeout,
            reply_id_pos,
        });
        Ok(())
    }

    /// Starts a reply to a received request, finalizing any message in
    /// progress. `reply_id` is the correlation id surfaced with the
    /// request message.
    pub fn start_reply(&mut self, reply_id: ReplyId) -> Result<()> {
        self.end_message()?;
        self.begin(&MessageSpec::reply(), false);
        self.data.put_u32(reply_id);
        Ok(())
    }

    fn begin(&mut self, spec: &MessageSpec, is_request: bool) {
        self.data.put_u8(spec.id);
        let length_field_pos = match spec.length {
            LengthStyle::Fixed(_) => None,
            LengthStyle::Variable(width) => {
                let pos = self.data.len();
                self.data.put_bytes(0, width.size());
                Some(pos)
            }
        };
        self.current = Some(OpenMessage {
            name: spec.name,
            length: spec.length,
            length_field_pos,
            data_start: self.data.len(),
            is_request,
        });
    }

    /// Appends payload bytes to the message in progress.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.require_open()?;
        self.data.put_slice(bytes);
        Ok(())
    }

    pub fn put_u8(&mut self, value: u8) -> Result<()> {
        self.require_open()?;
        self.data.put_u8(value);
        Ok(())
    }

    pub fn put_u16(&mut self, value: u16) -> Result<()> {
        self.require_open()?;
        self.data.put_u16(value);
        Ok(())
    }

    pub fn put_u32(&mut self, value: u32) -> Result<()> {
        self.require_open()?;
        self.data.put_u32(value);
        Ok(())
    }

    fn require_open(&self) -> Result<()> {
        if self.current.is_none() {
            return Err(ProtocolError::Custom(
                "no message in progress on bundle".into(),
            ));
        }
        Ok(())
    }

    /// Finalizes the message in progress, patching its length in place.
    fn end_message(&mut self) -> Result<()> {
        let Some(open) = self.current.take() else {
            return Ok(());
        };

        let data_len = self.data.len() - open.data_start;
        match (open.length, open.length_field_pos) {
            (LengthStyle::Fixed(expected), _) => {
                let slots = if open.is_request { 6 } else { 0 };
                if data_len != expected + slots {
                    return Err(ProtocolError::CorruptBundle(format!(
                        "fixed-length message '{}' wrote {} bytes, expected {}",
                        open.name,
                        data_len - slots,
                        expected
                    )));
                }
            }
            (LengthStyle::Variable(width), Some(pos)) => {
                if data_len > width.max_value() {
                    return Err(ProtocolError::CorruptBundle(format!(
                        "message '{}' length {} exceeds its {}-byte length field",
                        open.name,
                        data_len,
                        width.size()
                    )));
                }
                width.write(data_len, &mut self.data[pos..pos + width.size()]);
            }
            (LengthStyle::Variable(_), None) => {
                return Err(ProtocolError::CorruptBundle(format!(
                    "message '{}' lost its length slot",
                    open.name
                )));
            }
        }

        self.num_messages += 1;
        Ok(())
    }

    /// Finalizes the bundle for sending: patches the trailing message,
    /// registers every pending request with the tracker and stamps the
    /// assigned reply ids. Returns the frame payload and resets the
    /// bundle for the next batch.
    pub fn finalize(&mut self, tracker: &mut RequestTracker) -> Result<BytesMut> {
        self.end_message()?;

        for order in self.reply_orders.drain(..) {
            let reply_id = tracker.register(order.handler, order.timeout);
            self.data[order.reply_id_pos..order.reply_id_pos + 4]
                .copy_from_slice(&reply_id.to_be_bytes());
        }

        let payload = self.data.split();
        self.data.put_u16(NO_REQUEST);
        self.num_messages = 0;
        self.last_request_link = None;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::requests::testing::RecordingHandler;

    fn spec(id: MessageId, length: LengthStyle) -> MessageSpec {
        MessageSpec {
            id,
            name: "test",
            length,
        }
    }

    #[test]
    fn variable_length_patched_on_next_message() {
        let mut bundle = Bundle::new();
        let mut tracker = RequestTracker::new();

        bundle
            .start_message(&spec(0x01, LengthStyle::Variable(LengthWidth::Two)))
            .unwrap();
        bundle.append(b"abc").unwrap();
        bundle
            .start_message(&spec(0x02, LengthStyle::Variable(LengthWidth::One)))
            .unwrap();
        bundle.append(b"xy").unwrap();

        let payload = bundle.finalize(&mut tracker).unwrap();
        // Head offset, then: id, u16 len, "abc", id, u8 len, "xy".
        assert_eq!(
            &payload[..],
            &[
                0xFF, 0xFF, // no requests
                0x01, 0x00, 0x03, b'a', b'b', b'c', //
                0x02, 0x02, b'x', b'y',
            ]
        );
        assert!(bundle.is_empty());
    }

    #[test]
    fn fixed_length_mismatch_is_rejected() {
        let mut bundle = Bundle::new();
        bundle
            .start_message(&spec(0x03, LengthStyle::Fixed(4)))
            .unwrap();
        bundle.append(b"abc").unwrap();
        let err = bundle
            .start_message(&spec(0x04, LengthStyle::Fixed(1)))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::CorruptBundle(_)));
    }

    #[test]
    fn request_chain_offsets() {
        let mut bundle = Bundle::new();
        let mut tracker = RequestTracker::new();
        let handler = RecordingHandler::new();

        bundle
            .start_message(&spec(0x01, LengthStyle::Variable(LengthWidth::One)))
            .unwrap();
        bundle.append(b"pad").unwrap();
        bundle
            .start_request(
                &spec(0x02, LengthStyle::Variable(LengthWidth::One)),
                Box::new(handler.clone()),
                None,
            )
            .unwrap();
        bundle.append(b"q1").unwrap();
        bundle
            .start_request(
                &spec(0x03, LengthStyle::Variable(LengthWidth::One)),
                Box::new(handler.clone()),
                None,
            )
            .unwrap();
        bundle.append(b"q2").unwrap();

        let payload = bundle.finalize(&mut tracker).unwrap();
        assert_eq!(tracker.pending_count(), 2);

        // Head offset points at the first request's id byte.
        let head = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        assert_eq!(payload[head], 0x02);

        // First request: id, len, reply id, link, payload.
        let first_reply_id = u32::from_be_bytes([
            payload[head + 2],
            payload[head + 3],
            payload[head + 4],
            payload[head + 5],
        ]);
        assert_eq!(first_reply_id, 1);
        let next = u16::from_be_bytes([payload[head + 6], payload[head + 7]]) as usize;
        assert_eq!(payload[next], 0x03);

        // Second request terminates the chain.
        let end = u16::from_be_bytes([payload[next + 6], payload[next + 7]]);
        assert_eq!(end, NO_REQUEST);

        // Request length covers the correlation slots plus the payload.
        assert_eq!(payload[head + 1] as usize, 6 + 2);
    }

    #[test]
    fn reply_carries_correlation_id() {
        let mut bundle = Bundle::new();
        let mut tracker = RequestTracker::new();

        bundle.start_reply(0xDEAD_BEEF).unwrap();
        bundle.append(b"ok").unwrap();
        let payload = bundle.finalize(&mut tracker).unwrap();

        assert_eq!(payload[2], REPLY_MESSAGE_ID);
        // 4-byte length counts the correlation id and the payload.
        let len = u32::from_be_bytes([payload[3], payload[4], payload[5], payload[6]]);
        assert_eq!(len, 6);
        let id = u32::from_be_bytes([payload[7], payload[8], payload[9], payload[10]]);
        assert_eq!(id, 0xDEAD_BEEF);
        assert_eq!(&payload[11..], b"ok");
    }

    #[test]
    fn reserved_id_rejected() {
        let mut bundle = Bundle::new();
        let err = bundle
            .start_message(&spec(REPLY_MESSAGE_ID, LengthStyle::Fixed(0)))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Custom(_)));
    }

    #[test]
    fn finalize_resets_for_next_batch() {
        let mut bundle = Bundle::new();
        let mut tracker = RequestTracker::new();

        bundle
            .start_message(&spec(0x01, LengthStyle::Variable(LengthWidth::One)))
            .unwrap();
        bundle.append(b"a").unwrap();
        let first = bundle.finalize(&mut tracker).unwrap();
        assert!(!first.is_empty());

        assert!(bundle.is_empty());
        assert_eq!(bundle.size(), 2);
        let second = bundle.finalize(&mut tracker).unwrap();
        assert_eq!(&second[..], &[0xFF, 0xFF]);
    }
}
