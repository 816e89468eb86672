//! Length-prefixed transport frame wire format.
//!
//! Every logical unit on a transport channel is one self-delimited frame:
//! a 2-byte big-endian length when the payload is shorter than `0xFFFF`
//! bytes, otherwise the 2-byte sentinel `0xFFFF` followed by a 4-byte
//! big-endian length. The decoded length always equals the number of
//! payload bytes transferred.
//!
//! Decoding is incremental: [`FrameDecoder`] carries the partially parsed
//! header across read events, so it can be re-invoked whenever more bytes
//! arrive without losing state. [`FrameCodec`] exposes the same wire format
//! through `tokio_util`'s codec traits for embedders that want a plain
//! `Framed` transport without the channel machinery.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};

/// First frame payload sent by a connection-initiating peer on a raw
/// channel, validated byte-exact by the accepting side.
pub const PREAMBLE: &[u8] = b"TCP\r\n\r\n";

/// Sentinel in the 2-byte length slot announcing a 4-byte extended length.
pub const LARGE_LENGTH_SENTINEL: u16 = 0xFFFF;

/// Largest payload length encodable in the short 2-byte header.
pub const SMALL_LENGTH_MAX: usize = (LARGE_LENGTH_SENTINEL as usize) - 1;

/// Default cap on a single frame's payload, guarding against memory
/// exhaustion from a hostile length field.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Appends the length header for a payload of `len` bytes to `dst`.
pub fn encode_length(len: usize, dst: &mut BytesMut) {
    if len <= SMALL_LENGTH_MAX {
        dst.put_u16(len as u16);
    } else {
        dst.put_u16(LARGE_LENGTH_SENTINEL);
        dst.put_u32(len as u32);
    }
}

/// Appends a complete frame (header and payload) to `dst`.
pub fn encode_frame(payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(header_size_for(payload.len()) + payload.len());
    encode_length(payload.len(), dst);
    dst.put_slice(payload);
}

/// Header size the encoder will emit for a payload of `len` bytes.
pub fn header_size_for(len: usize) -> usize {
    if len <= SMALL_LENGTH_MAX {
        2
    } else {
        6
    }
}

/// Parses a length header from the start of `buf` without consuming it.
///
/// Returns `(header_len, payload_len)`, or `None` if the buffer does not
/// yet hold a complete header.
pub fn peek_length(buf: &[u8]) -> Option<(usize, usize)> {
    if buf.len() < 2 {
        return None;
    }
    let small = u16::from_be_bytes([buf[0], buf[1]]);
    if small != LARGE_LENGTH_SENTINEL {
        return Some((2, small as usize));
    }
    if buf.len() < 6 {
        return None;
    }
    let large = u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]);
    Some((6, large as usize))
}

/// Incremental frame decoder.
///
/// Carries the header state of the frame currently being assembled; a
/// partially received frame's bytes stay in the caller's buffer until the
/// next read event completes them.
#[derive(Debug)]
pub struct FrameDecoder {
    /// Payload length of the current frame once the header has been parsed.
    payload_len: Option<usize>,
    /// Header length consumed for the current frame (2 or 6).
    header_len: usize,
    max_frame_length: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            payload_len: None,
            header_len: 0,
            max_frame_length,
        }
    }

    /// Attempts to extract one complete frame payload from `buf`.
    ///
    /// Consumes the frame's bytes from `buf` on success. Returns
    /// `Ok(None)` when more data is needed; header state is retained for
    /// the next call.
    ///
    /// # Errors
    /// Returns `ProtocolError::OversizedFrame` if the decoded length
    /// exceeds the configured maximum.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>> {
        if self.payload_len.is_none() {
            match peek_length(buf) {
                Some((header_len, payload_len)) => {
                    if payload_len > self.max_frame_length {
                        return Err(ProtocolError::OversizedFrame(payload_len));
                    }
                    buf.advance(header_len);
                    self.header_len = header_len;
                    self.payload_len = Some(payload_len);
                }
                None => return Ok(None),
            }
        }

        let payload_len = self.payload_len.unwrap_or(0);
        if buf.len() < payload_len {
            return Ok(None);
        }

        self.payload_len = None;
        self.header_len = 0;
        Ok(Some(buf.split_to(payload_len).freeze()))
    }

    /// Whether a frame header has been parsed but its payload is still
    /// incomplete.
    pub fn is_mid_frame(&self) -> bool {
        self.payload_len.is_some()
    }
}

/// Tokio codec over the transport frame format.
///
/// Each item is one frame payload; framing bytes never surface.
#[derive(Debug, Default)]
pub struct FrameCodec {
    decoder: FrameDecoder,
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            decoder: FrameDecoder::new(max_frame_length),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>> {
        self.decoder.decode(src)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<()> {
        encode_frame(&item, dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_frame_wire_bytes() {
        let mut buf = BytesMut::new();
        encode_frame(b"hello", &mut buf);
        assert_eq!(&buf[..], &[0x00, 0x05, b'h', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn large_frame_header_bytes() {
        let payload = vec![0xAB; 70_000];
        let mut buf = BytesMut::new();
        encode_frame(&payload, &mut buf);
        assert_eq!(&buf[..6], &[0xFF, 0xFF, 0x00, 0x01, 0x11, 0x70]);
        assert_eq!(buf.len(), 6 + 70_000);
    }

    #[test]
    fn header_width_boundary() {
        // 0xFFFE is the largest payload a short header can carry.
        let mut buf = BytesMut::new();
        encode_length(0xFFFE, &mut buf);
        assert_eq!(&buf[..], &[0xFF, 0xFE]);

        let mut buf = BytesMut::new();
        encode_length(0xFFFF, &mut buf);
        assert_eq!(&buf[..], &[0xFF, 0xFF, 0x00, 0x00, 0xFF, 0xFF]);
    }

    #[test]
    fn decode_round_trip() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        encode_frame(b"first", &mut buf);
        encode_frame(b"second", &mut buf);

        let one = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&one[..], b"first");
        let two = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&two[..], b"second");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_partial_delivery() {
        let mut decoder = FrameDecoder::default();
        let mut wire = BytesMut::new();
        encode_frame(&vec![0x42; 300], &mut wire);

        // Deliver one byte at a time; the decoder must retain state.
        let mut buf = BytesMut::new();
        let mut got = None;
        for byte in wire.iter() {
            buf.put_u8(*byte);
            if let Some(frame) = decoder.decode(&mut buf).unwrap() {
                got = Some(frame);
            }
        }
        let frame = got.expect("frame should complete on the last byte");
        assert_eq!(frame.len(), 300);
        assert!(frame.iter().all(|b| *b == 0x42));
    }

    #[test]
    fn decode_zero_length_frame() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(&[0x00, 0x00][..]);
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
        assert!(!decoder.is_mid_frame());
    }

    #[test]
    fn decode_rejects_oversized_claim() {
        let mut decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::new();
        buf.put_u16(LARGE_LENGTH_SENTINEL);
        buf.put_u32(1_000_000);
        let err = decoder.decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolError::OversizedFrame(1_000_000)));
    }

    #[test]
    fn length_fidelity_across_classes() {
        for len in [0usize, 1, 125, 0xFFFE, 0xFFFF, 0x10000] {
            let payload = vec![0x5A; len];
            let mut buf = BytesMut::new();
            encode_frame(&payload, &mut buf);

            let expected_header = if len < 0xFFFF { 2 } else { 6 };
            assert_eq!(buf.len(), expected_header + len);

            let mut decoder = FrameDecoder::default();
            let frame = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.len(), len);
        }
    }
}
