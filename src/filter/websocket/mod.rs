//! RFC 6455 WebSocket stream filter.
//!
//! Wraps a stream and turns it into a WebSocket connection: HTTP upgrade
//! handshake in both roles, frame masking, control frames and the close
//! handshake. The filter is binary-only; one application write becomes one
//! FIN BINARY frame, and TEXT frames from the peer fail the connection.
//!
//! Frame reception is an explicit incremental state machine: header bytes,
//! the length-class byte, the extended length and the masking key are
//! accumulated across read events until the total frame size is known,
//! then the frame is buffered until it has fully arrived.

pub mod handshake;
pub mod http;

use bytes::{Buf, BufMut, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::core::stream::{Stream, WriteMode};
use crate::error::{constants, ProtocolError, Result};
use http::{HttpRequest, HttpResponse};

pub use handshake::{AcceptAll, HandshakeHandler, WEBSOCKET_GUID};

// Frame layout constants.
const FIN: u8 = 0x80;
const MASK_BIT: u8 = 0x80;
const OPCODE_BITMASK: u8 = 0x0F;
const LENGTH_BITMASK: u8 = 0x7F;
const MAX_SMALL_LENGTH: usize = 125;
const MEDIUM_LENGTH: u8 = 126;
const LARGE_LENGTH: u8 = 127;
const MASKING_KEY_LENGTH: usize = 4;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Default bound on an incoming handshake header block.
pub const DEFAULT_MAX_HANDSHAKE_LENGTH: usize = 4096;

/// WebSocket version this filter speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Close status codes from RFC 6455 section 7.4.
pub mod close_status {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED_DATA: u16 = 1003;
    pub const NO_STATUS_RECEIVED: u16 = 1005;
    pub const INVALID_FRAME_PAYLOAD_DATA: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const MESSAGE_TOO_BIG: u16 = 1009;
    pub const INTERNAL_SERVER_ERROR: u16 = 1011;
}

/// Human-readable phrase for a close status code.
pub fn close_status_reason(status: u16) -> &'static str {
    match status {
        close_status::NORMAL => "Normal closure",
        close_status::GOING_AWAY => "Going away",
        close_status::PROTOCOL_ERROR => "Protocol error",
        close_status::UNSUPPORTED_DATA => "Unsupported data",
        close_status::NO_STATUS_RECEIVED => "No status received",
        close_status::INVALID_FRAME_PAYLOAD_DATA => "Invalid frame payload data",
        close_status::POLICY_VIOLATION => "Policy violation",
        close_status::MESSAGE_TOO_BIG => "Message too big",
        close_status::INTERNAL_SERVER_ERROR => "Internal server error",
        _ => "Unknown",
    }
}

/// WebSocket frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl Opcode {
    fn from_u8(value: u8) -> Self {
        match value & OPCODE_BITMASK {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(v) => v,
        }
    }

    fn is_control(self) -> bool {
        // Reserved opcodes 0xB..0xF count as control frames too.
        self.as_u8() >= 0x8
    }
}

/// XOR the payload byte-wise against the masking key cycled mod 4.
fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Close handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseState {
    NotClosing,
    /// Shutdown was requested before the handshake finished; the CLOSE
    /// frame goes out as soon as the handshake completes.
    CloseOnConnect,
    CloseSent,
    Closed,
}

enum Role {
    Client {
        /// Accept digest the `101` response must carry.
        expected_accept: String,
    },
    Server {
        handler: Box<dyn HandshakeHandler>,
    },
}

/// The RFC 6455 stream filter.
pub struct WebSocketFilter {
    stream: Box<dyn Stream>,
    role: Role,
    handshake_complete: bool,
    /// Raw bytes from below: handshake text, then frame data.
    receive_buf: BytesMut,
    /// Length-field size of the frame being assembled (1, 3 or 9 bytes
    /// counting the length-class byte); 0 while unknown.
    expected_length_field_size: usize,
    /// Total size of the frame being assembled, header included; 0 while
    /// unknown.
    expected_frame_length: usize,
    /// Opcode of the fragmented message being assembled.
    message_opcode: Option<Opcode>,
    /// Payload accumulator spanning continuation frames until FIN.
    message_buf: BytesMut,
    /// Application writes buffered until the handshake completes.
    send_buf: BytesMut,
    close_state: CloseState,
    max_handshake_length: usize,
    max_frame_length: usize,
}

impl WebSocketFilter {
    /// Creates a client-role filter over `stream` and immediately sends
    /// the upgrade request. Application writes are buffered until the
    /// server's `101` response validates.
    pub fn client(
        stream: Box<dyn Stream>,
        host: &str,
        uri: &str,
        origin: Option<&str>,
        max_frame_length: usize,
    ) -> Result<Self> {
        let key = handshake::generate_key()?;
        let expected_accept = handshake::accept_digest(&key);

        let mut filter = Self {
            stream,
            role: Role::Client { expected_accept },
            handshake_complete: false,
            receive_buf: BytesMut::new(),
            expected_length_field_size: 0,
            expected_frame_length: 0,
            message_opcode: None,
            message_buf: BytesMut::new(),
            send_buf: BytesMut::new(),
            close_state: CloseState::NotClosing,
            max_handshake_length: DEFAULT_MAX_HANDSHAKE_LENGTH,
            max_frame_length,
        };
        filter.send_handshake_request(host, uri, origin, &key)?;
        Ok(filter)
    }

    /// Creates a server-role filter over `stream`. The handler decides
    /// whether each incoming handshake is accepted and which subprotocols
    /// are negotiated.
    pub fn server(
        stream: Box<dyn Stream>,
        handler: Box<dyn HandshakeHandler>,
        max_handshake_length: usize,
        max_frame_length: usize,
    ) -> Self {
        Self {
            stream,
            role: Role::Server { handler },
            handshake_complete: false,
            receive_buf: BytesMut::new(),
            expected_length_field_size: 0,
            expected_frame_length: 0,
            message_opcode: None,
            message_buf: BytesMut::new(),
            send_buf: BytesMut::new(),
            close_state: CloseState::NotClosing,
            max_handshake_length,
            max_frame_length,
        }
    }

    fn is_client(&self) -> bool {
        matches!(self.role, Role::Client { .. })
    }

    fn send_handshake_request(
        &mut self,
        host: &str,
        uri: &str,
        origin: Option<&str>,
        key: &str,
    ) -> Result<()> {
        let mut request = format!(
            "GET {uri} HTTP/1.1\r\n\
Host: {host}\r\n\
Connection: Upgrade\r\n\
Upgrade: websocket\r\n\
Sec-WebSocket-Key: {key}\r\n\
Sec-WebSocket-Version: {WEBSOCKET_VERSION}\r\n"
        );
        if let Some(origin) = origin {
            request.push_str(&format!("Origin: {origin}\r\n"));
        }
        request.push_str("\r\n");

        let mut bytes = BytesMut::from(request.as_bytes());
        self.stream.write_from(&mut bytes, WriteMode::Uncork)
    }

    /// Accumulates handshake bytes until the terminating blank line, then
    /// parses and processes the request or response. Bytes beyond the
    /// terminator stay buffered for frame processing.
    fn receive_handshake(&mut self) -> Result<()> {
        if !self.is_client() && self.receive_buf.len() > self.max_handshake_length {
            warn!(
                received = self.receive_buf.len(),
                limit = self.max_handshake_length,
                "Handshake header exceeds limit"
            );
            return Err(ProtocolError::HandshakeError(
                constants::ERR_HANDSHAKE_TOO_LARGE.into(),
            ));
        }

        let Some(end) = self
            .receive_buf
            .windows(HEADER_TERMINATOR.len())
            .position(|w| w == HEADER_TERMINATOR)
        else {
            return Ok(()); // wait for more bytes
        };

        let head = self.receive_buf.split_to(end + HEADER_TERMINATOR.len());
        if self.is_client() {
            let response = HttpResponse::parse(&head)?;
            self.process_handshake_from_server(&response)
        } else {
            let request = HttpRequest::parse(&head)?;
            self.process_handshake_from_client(&request)
        }
    }

    /// Basic header validation of a client's upgrade request.
    fn check_client_handshake(&self, request: &HttpRequest) -> std::result::Result<(), String> {
        if request.method() != "GET" {
            return Err(format!("invalid request method \"{}\"", request.method()));
        }
        let (major, minor) = request.http_version();
        if (major, minor) < (1, 1) {
            return Err(format!("bad HTTP version {major}.{minor}"));
        }
        let headers = request.headers();
        if !headers.contains("host") {
            return Err("missing Host header".into());
        }
        if !headers.value_contains_ignore_case("upgrade", "websocket") {
            return Err(format!(
                "missing or invalid Upgrade header \"{}\"",
                headers.value_for("upgrade")
            ));
        }
        if !headers.value_contains_ignore_case("connection", "upgrade") {
            return Err(format!(
                "missing or invalid Connection header \"{}\"",
                headers.value_for("connection")
            ));
        }
        if !headers.contains("sec-websocket-key") {
            return Err("missing Sec-WebSocket-Key header".into());
        }
        if headers.value_for("sec-websocket-version") != WEBSOCKET_VERSION {
            return Err(format!(
                "invalid Sec-WebSocket-Version \"{}\"",
                headers.value_for("sec-websocket-version")
            ));
        }
        Ok(())
    }

    /// Validates and answers a handshake request from a client.
    fn process_handshake_from_client(&mut self, request: &HttpRequest) -> Result<()> {
        if let Err(reason) = self.check_client_handshake(request) {
            warn!(%reason, "Rejecting handshake");
            self.reject_handshake("400", "Bad Request")?;
            return Err(ProtocolError::HandshakeError(reason));
        }

        let key = request.headers().value_for("sec-websocket-key").to_string();
        if let Err(e) = handshake::validate_key(&key) {
            warn!(error = %e, "Rejecting handshake");
            self.reject_handshake("400", "Bad Request")?;
            return Err(e);
        }
        let accept = handshake::accept_digest(&key);

        let proposed_header = request.headers().contains("sec-websocket-protocol");
        let mut subprotocols = handshake::parse_subprotocols(
            request.headers().value_for("sec-websocket-protocol"),
        );
        let accepted = match &mut self.role {
            Role::Server { handler } => {
                handler.should_accept_handshake(request, &mut subprotocols)
            }
            Role::Client { .. } => true,
        };
        if !accepted {
            self.reject_handshake("403", "Forbidden")?;
            return Err(ProtocolError::HandshakeError(
                constants::ERR_HANDSHAKE_REJECTED.into(),
            ));
        }

        debug!(
            host = request.headers().value_for("host"),
            uri = request.uri(),
            origin = request.headers().value_for("origin"),
            subprotocols = subprotocols.join(",").as_str(),
            "Handshake received successfully"
        );

        let mut extra_headers = String::new();
        if proposed_header && !subprotocols.is_empty() {
            extra_headers.push_str(&format!(
                "Sec-WebSocket-Protocol: {}\r\n",
                subprotocols.join(",")
            ));
        }
        extra_headers.push_str(&format!("Sec-WebSocket-Accept: {accept}\r\n"));

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n{extra_headers}\r\n"
        );
        let mut bytes = BytesMut::from(response.as_bytes());
        self.stream.write_from(&mut bytes, WriteMode::Uncork)?;

        self.finish_handshake()
    }

    /// Validates a `101` response from the server.
    fn process_handshake_from_server(&mut self, response: &HttpResponse) -> Result<()> {
        let (major, minor) = response.http_version();
        if (major, minor) < (1, 1) {
            return Err(ProtocolError::HandshakeError(format!(
                "bad HTTP version {major}.{minor}"
            )));
        }
        if response.status_code() != "101" {
            return Err(ProtocolError::HandshakeError(format!(
                "invalid status code \"{}\" ({})",
                response.status_code(),
                response.reason_phrase()
            )));
        }
        if !response
            .headers()
            .value_equals_ignore_case("upgrade", "websocket")
        {
            return Err(ProtocolError::HandshakeError(format!(
                "invalid Upgrade header \"{}\"",
                response.headers().value_for("upgrade")
            )));
        }
        if !response
            .headers()
            .value_equals_ignore_case("connection", "upgrade")
        {
            return Err(ProtocolError::HandshakeError(format!(
                "invalid Connection header \"{}\"",
                response.headers().value_for("connection")
            )));
        }

        let expected = match &mut self.role {
            Role::Client { expected_accept } => std::mem::take(expected_accept),
            Role::Server { .. } => String::new(),
        };
        if response.headers().value_for("sec-websocket-accept") != expected {
            return Err(ProtocolError::HandshakeError(
                constants::ERR_BAD_ACCEPT_DIGEST.into(),
            ));
        }

        trace!("Handshake response validated");
        self.finish_handshake()
    }

    /// Marks the handshake complete, flushes buffered application writes
    /// and honors a pre-handshake shutdown request.
    fn finish_handshake(&mut self) -> Result<()> {
        self.handshake_complete = true;
        self.send_buffered_data()?;
        if self.close_state == CloseState::CloseOnConnect {
            self.send_close_frame(close_status::NORMAL, close_status_reason(close_status::NORMAL))?;
        }
        Ok(())
    }

    /// Sends an HTTP error response for a rejected handshake.
    fn reject_handshake(&mut self, status: &str, reason: &str) -> Result<()> {
        let response = format!(
            "HTTP/1.1 {status} {reason}\r\n\
Sec-WebSocket-Version: {WEBSOCKET_VERSION}\r\n\r\n"
        );
        let mut bytes = BytesMut::from(response.as_bytes());
        self.stream.write_from(&mut bytes, WriteMode::Uncork)
    }

    /// Sends any buffered application data as one BINARY frame.
    fn send_buffered_data(&mut self) -> Result<()> {
        if !self.handshake_complete || self.send_buf.is_empty() {
            return Ok(());
        }
        let payload = self.send_buf.split();
        self.send_frame(Opcode::Binary, payload)
    }

    /// Sends one FIN frame with the given opcode, masking it in the
    /// client role.
    fn send_frame(&mut self, opcode: Opcode, mut payload: BytesMut) -> Result<()> {
        let mask_flag = if self.is_client() { MASK_BIT } else { 0 };

        let mut header = BytesMut::with_capacity(10);
        header.put_u8(FIN | opcode.as_u8());
        let len = payload.len();
        if len <= MAX_SMALL_LENGTH {
            header.put_u8(mask_flag | len as u8);
        } else if len <= u16::MAX as usize {
            header.put_u8(mask_flag | MEDIUM_LENGTH);
            header.put_u16(len as u16);
        } else {
            header.put_u8(mask_flag | LARGE_LENGTH);
            header.put_u64(len as u64);
        }
        self.stream.write_from(&mut header, WriteMode::Cork)?;

        if self.is_client() {
            let key: [u8; 4] = rand::random();
            apply_mask(&mut payload, key);
            let mut body = BytesMut::with_capacity(MASKING_KEY_LENGTH + payload.len());
            body.put_slice(&key);
            body.extend_from_slice(&payload);
            self.stream.write_from(&mut body, WriteMode::Uncork)
        } else {
            self.stream.write_from(&mut payload, WriteMode::Uncork)
        }
    }

    /// Extracts every complete frame currently buffered.
    fn receive_frames(&mut self, output: &mut BytesMut) -> Result<usize> {
        let mut total = 0;
        loop {
            if self.expected_length_field_size == 0 && self.receive_buf.len() >= 2 {
                let length_byte = (self.receive_buf[1] & LENGTH_BITMASK) as usize;
                self.expected_length_field_size = match length_byte {
                    0..=MAX_SMALL_LENGTH => 1,
                    126 => 1 + 2,
                    _ => 1 + 8,
                };
            }

            if self.expected_frame_length == 0
                && self.expected_length_field_size != 0
                && self.receive_buf.len() >= 1 + self.expected_length_field_size
            {
                self.compute_frame_length()?;
            }

            if self.expected_frame_length != 0
                && self.receive_buf.len() >= self.expected_frame_length
            {
                total += self.process_frame_fragment(output)?;
            } else {
                break;
            }
        }
        Ok(total)
    }

    /// Derives the total frame size once the length field has arrived.
    fn compute_frame_length(&mut self) -> Result<()> {
        let data = &self.receive_buf;
        let masked = data[1] & MASK_BIT != 0;
        let payload_len = match self.expected_length_field_size {
            1 => (data[1] & LENGTH_BITMASK) as u64,
            3 => u16::from_be_bytes([data[2], data[3]]) as u64,
            _ => u64::from_be_bytes([
                data[2], data[3], data[4], data[5], data[6], data[7], data[8], data[9],
            ]),
        };
        let header_size = 1
            + self.expected_length_field_size
            + if masked { MASKING_KEY_LENGTH } else { 0 };

        if payload_len > self.max_frame_length as u64 {
            error!(
                payload_len,
                limit = self.max_frame_length,
                "Frame exceeds maximum length"
            );
            self.fail_connection(
                close_status::MESSAGE_TOO_BIG,
                close_status_reason(close_status::MESSAGE_TOO_BIG),
            );
            return Err(ProtocolError::WebSocketViolation(
                "frame exceeds maximum length".into(),
            ));
        }

        self.expected_frame_length = header_size + payload_len as usize;
        Ok(())
    }

    /// Consumes one complete frame from the buffer: unmasks, enforces the
    /// fragmentation rules and dispatches by opcode.
    fn process_frame_fragment(&mut self, output: &mut BytesMut) -> Result<usize> {
        let frame_length = self.expected_frame_length;
        let field_size = self.expected_length_field_size;
        self.expected_frame_length = 0;
        self.expected_length_field_size = 0;

        let mut frame = self.receive_buf.split_to(frame_length);
        let first = frame[0];
        let second = frame[1];
        let fin = first & FIN != 0;
        let opcode = Opcode::from_u8(first);
        let masked = second & MASK_BIT != 0;

        frame.advance(1 + field_size);
        let payload = if masked {
            let key = [frame[0], frame[1], frame[2], frame[3]];
            frame.advance(MASKING_KEY_LENGTH);
            let mut payload = frame;
            apply_mask(&mut payload, key);
            payload
        } else {
            frame
        };

        trace!(?opcode, fin, masked, bytes = payload.len(), "Received frame");

        if opcode.is_control() {
            if !fin {
                self.fail_connection(close_status::PROTOCOL_ERROR, "Fragmented control frame");
                return Err(ProtocolError::WebSocketViolation(
                    "fragmented control frame".into(),
                ));
            }
            self.process_control_frame(opcode, payload)?;
            return Ok(0);
        }

        match self.message_opcode {
            None => {
                if opcode == Opcode::Continuation {
                    self.fail_connection(
                        close_status::PROTOCOL_ERROR,
                        "Continuation opcode on first fragment",
                    );
                    return Err(ProtocolError::WebSocketViolation(
                        "continuation opcode on first fragment".into(),
                    ));
                }
                self.message_opcode = Some(opcode);
            }
            Some(_) => {
                if opcode != Opcode::Continuation {
                    self.fail_connection(
                        close_status::PROTOCOL_ERROR,
                        "Data opcode inside fragmented message",
                    );
                    return Err(ProtocolError::WebSocketViolation(
                        "data opcode inside fragmented message".into(),
                    ));
                }
            }
        }

        self.message_buf.extend_from_slice(&payload);
        if fin {
            let opcode = self
                .message_opcode
                .take()
                .unwrap_or(Opcode::Binary);
            return self.process_message(opcode, output);
        }
        Ok(0)
    }

    /// Handles a completed logical message.
    fn process_message(&mut self, opcode: Opcode, output: &mut BytesMut) -> Result<usize> {
        match opcode {
            Opcode::Text => {
                self.message_buf.clear();
                self.fail_connection(close_status::PROTOCOL_ERROR, "Text frames not accepted");
                Err(ProtocolError::WebSocketViolation(
                    "text frames not accepted".into(),
                ))
            }
            Opcode::Binary => {
                let bytes = self.message_buf.split();
                output.extend_from_slice(&bytes);
                Ok(bytes.len())
            }
            _ => {
                // Reserved data opcodes: discard the payload.
                self.message_buf.clear();
                Ok(0)
            }
        }
    }

    /// Handles a control frame without disturbing any fragmented message
    /// in progress.
    fn process_control_frame(&mut self, opcode: Opcode, payload: BytesMut) -> Result<()> {
        match opcode {
            Opcode::Close => {
                self.process_close_frame(payload);
                Ok(())
            }
            Opcode::Ping => self.send_frame(Opcode::Pong, payload),
            Opcode::Pong => {
                trace!("PONG discarded");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Drives the close state machine on a received CLOSE frame.
    fn process_close_frame(&mut self, mut payload: BytesMut) {
        match self.close_state {
            CloseState::CloseSent => {
                // The peer answered our CLOSE; the handshake is complete.
                trace!("Close handshake complete");
                self.close_state = CloseState::Closed;
                self.stream.shut_down();
            }
            CloseState::NotClosing => {
                let status = if payload.len() >= 2 {
                    payload.get_u16()
                } else {
                    close_status::NORMAL
                };
                let reason = String::from_utf8_lossy(&payload).into_owned();
                debug!(status, reason = reason.as_str(), "Got unsolicited CLOSE");

                // Echo the status and reason, then shut down.
                let _ = self.send_close_frame(status, &reason);
                self.close_state = CloseState::Closed;
                self.stream.shut_down();
            }
            CloseState::Closed | CloseState::CloseOnConnect => {}
        }
    }

    /// Sends a CLOSE frame carrying a status code and UTF-8 reason,
    /// flushing buffered application data first.
    fn send_close_frame(&mut self, status: u16, reason: &str) -> Result<()> {
        self.send_buffered_data()?;

        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(status);
        payload.put_slice(reason.as_bytes());

        debug!(status, reason, "Sending CLOSE frame");
        self.send_frame(Opcode::Close, payload)?;

        if self.close_state != CloseState::Closed {
            self.close_state = CloseState::CloseSent;
        }
        Ok(())
    }

    /// "Fail the WebSocket Connection" per RFC 6455 section 7.1.7:
    /// best-effort CLOSE if the handshake already completed, then
    /// teardown.
    fn fail_connection(&mut self, status: u16, reason: &str) {
        if self.handshake_complete {
            let _ = self.send_close_frame(status, reason);
        }
        self.close_state = CloseState::Closed;
        self.stream.shut_down();
    }
}

impl Stream for WebSocketFilter {
    fn write_from(&mut self, input: &mut BytesMut, mode: WriteMode) -> Result<()> {
        if self.close_state != CloseState::NotClosing {
            return Err(ProtocolError::ConnectionClosed);
        }

        self.send_buf.extend_from_slice(&input.split());
        if mode.is_corked() || !self.handshake_complete {
            return Ok(());
        }
        self.send_buffered_data()
    }

    fn read_into(&mut self, output: &mut BytesMut) -> Result<usize> {
        let bytes_from_stream = self.stream.read_into(&mut self.receive_buf)?;
        if bytes_from_stream == 0 {
            return Ok(0);
        }

        if !self.handshake_complete {
            if let Err(e) = self.receive_handshake() {
                warn!(error = %e, stream = self.descriptor().as_str(), "Failed handshake");
                self.fail_connection(
                    close_status::PROTOCOL_ERROR,
                    close_status_reason(close_status::PROTOCOL_ERROR),
                );
                return Err(e);
            }
        }

        if !self.handshake_complete {
            return Ok(0);
        }

        self.receive_frames(output)
    }

    fn shut_down(&mut self) {
        if self.did_finish_shutting_down() {
            self.stream.shut_down();
        }
    }

    fn did_finish_shutting_down(&mut self) -> bool {
        match self.close_state {
            CloseState::Closed => {
                // Our closing protocol is done; the layers below do their
                // own shutdown handling now.
                self.stream.did_finish_shutting_down()
            }
            CloseState::CloseSent | CloseState::CloseOnConnect => false,
            CloseState::NotClosing => {
                if self.handshake_complete {
                    let _ = self.send_close_frame(
                        close_status::NORMAL,
                        close_status_reason(close_status::NORMAL),
                    );
                } else {
                    self.close_state = CloseState::CloseOnConnect;
                }
                false
            }
        }
    }

    fn has_unsent_data(&self) -> bool {
        !self.send_buf.is_empty() || self.stream.has_unsent_data()
    }

    fn is_connected(&self) -> bool {
        self.close_state == CloseState::NotClosing && self.stream.is_connected()
    }

    fn did_handle_inactivity_timeout(&mut self) -> bool {
        // Peer has not responded for a while; shut down gracefully.
        if self
            .send_close_frame(close_status::PROTOCOL_ERROR, "Inactivity timeout")
            .is_err()
        {
            self.close_state = CloseState::Closed;
            self.stream.shut_down();
            return true;
        }
        self.close_state = CloseState::CloseSent;
        true
    }

    fn descriptor(&self) -> String {
        let role = if self.is_client() {
            "ws-client"
        } else {
            "ws-server"
        };
        format!("{role}+{}", self.stream.descriptor())
    }
}
