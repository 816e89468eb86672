//! The TCP transport channel.
//!
//! Owns one non-blocking socket and implements the length-prefixed frame
//! protocol over it: preamble validation, incremental frame assembly,
//! corked sends, short-write queueing with writability retries, and the
//! half-close shutdown sequence. Stream filters stack on top through a
//! [`ChannelStreamAdaptor`] chain bottom; the channel holds only the head
//! of the chain.
//!
//! The very first frame from the connection-initiating side is the fixed
//! preamble [`PREAMBLE`](crate::core::frame::PREAMBLE), which lets an
//! accepting side distinguish a raw-protocol client from an HTTP/WebSocket
//! client arriving on the same port: the latter's first bytes start with
//! `GET ` and are rejected for raw channels.

use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

use crate::config::ChannelConfig;
use crate::core::frame::{self, FrameDecoder, PREAMBLE};
use crate::core::stream::{Stream, WriteMode};
use crate::error::{ProtocolError, Result};
use crate::filter::encryption::{BlockCipher, EncryptionFilter};
use crate::filter::websocket::{HandshakeHandler, WebSocketFilter};
use crate::protocol::bundle::Bundle;
use crate::protocol::processor::{BundleProcessor, InterfaceTable};
use crate::protocol::requests::RequestTracker;
use crate::transport::adaptor::ChannelStreamAdaptor;
use crate::transport::dispatcher::{ChannelToken, Dispatcher};
use crate::transport::socket::ChannelSocket;

/// First bytes of an HTTP request line, used to spot a WebSocket client
/// that reached a raw channel.
const HTTP_HEADER_START: &[u8] = b"GET ";

/// Read chunk size for draining the socket.
const READ_CHUNK: usize = 16 * 1024;

/// Why a channel went away, reported to its [`ChannelListener`].
#[derive(Debug)]
pub enum DestroyReason {
    /// The peer closed the connection while we were not shutting down.
    PeerDisconnect,
    /// The peer's half-close answered ours; clean shutdown.
    ShutdownComplete,
    /// The inactivity timeout fired and no filter consumed it.
    InactivityTimeout,
    /// A connection-fatal error.
    Error(ProtocolError),
}

/// Lifecycle callbacks for the owner of a channel.
pub trait ChannelListener {
    /// Called exactly once when the channel is destroyed.
    fn on_channel_destroyed(&mut self, reason: &DestroyReason);
}

/// Per-channel traffic counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelCounters {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Connection preamble progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    /// Client side: the preamble frame goes out with the first send.
    ClientSendPreamble,
    /// Server side: the first received frame must be the preamble.
    ServerAwaitPreamble,
    Done,
}

/// Socket-level half of the channel: raw reads, corked/queued writes and
/// the half-close. Shared between the channel and the adaptor at the
/// bottom of its filter chain.
pub(crate) struct ChannelCore {
    socket: Option<Box<dyn ChannelSocket>>,
    dispatcher: Rc<dyn Dispatcher>,
    token: ChannelToken,
    /// Corked writes accumulate here without a syscall.
    cork_buf: BytesMut,
    /// Bytes a short or blocked write left behind, retried on
    /// writability notifications.
    send_queue: Option<BytesMut>,
    peer: Option<SocketAddr>,
    connected: bool,
    peer_closed: bool,
    shutting_down: bool,
    shutdown_sent: bool,
}

impl ChannelCore {
    fn new(
        mut socket: Box<dyn ChannelSocket>,
        dispatcher: Rc<dyn Dispatcher>,
        token: ChannelToken,
        nodelay: bool,
    ) -> Self {
        if let Err(e) = socket.set_nodelay(nodelay) {
            warn!(error = %e, "Failed to set TCP_NODELAY");
        }
        let peer = socket.peer_addr();
        Self {
            socket: Some(socket),
            dispatcher,
            token,
            cork_buf: BytesMut::new(),
            send_queue: None,
            peer,
            connected: true,
            peer_closed: false,
            shutting_down: false,
            shutdown_sent: false,
        }
    }

    /// Drains whatever the socket has into `output`.
    ///
    /// An end-of-stream read marks the peer as disconnected; the channel
    /// turns that into teardown after processing buffered frames.
    pub(crate) fn read_into(&mut self, output: &mut BytesMut) -> Result<usize> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(ProtocolError::ConnectionClosed);
        };

        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match socket.try_read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    output.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.connected = false;
                    return Err(e.into());
                }
            }
        }
        Ok(total)
    }

    /// Writes `input`, corking or flushing per `mode`. Short writes queue
    /// the remainder and register write interest with the dispatcher.
    pub(crate) fn write_from(&mut self, input: &mut BytesMut, mode: WriteMode) -> Result<()> {
        if !self.connected {
            return Err(ProtocolError::ConnectionClosed);
        }

        if let Some(queue) = self.send_queue.as_mut() {
            // Already waiting on writability; append behind the queue.
            queue.extend_from_slice(&input.split());
            return Ok(());
        }

        if mode.is_corked() {
            self.cork_buf.extend_from_slice(&input.split());
            return Ok(());
        }

        let mut data = self.cork_buf.split();
        data.extend_from_slice(&input.split());
        self.flush(data)
    }

    fn flush(&mut self, mut data: BytesMut) -> Result<()> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(ProtocolError::ConnectionClosed);
        };

        while !data.is_empty() {
            match socket.try_write(&data) {
                Ok(0) => break,
                Ok(n) => {
                    let _ = data.split_to(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.connected = false;
                    return Err(e.into());
                }
            }
        }

        if !data.is_empty() {
            trace!(queued = data.len(), "Short write, waiting for writability");
            self.send_queue = Some(data);
            self.dispatcher.register_write_interest(self.token);
        }
        Ok(())
    }

    /// Retries queued bytes on a writability notification. Completes a
    /// deferred shutdown once the queue drains.
    pub(crate) fn send_buffered(&mut self) -> Result<()> {
        let Some(data) = self.send_queue.take() else {
            return Ok(());
        };
        self.flush(data)?;
        if self.send_queue.is_none() {
            self.dispatcher.cancel_write_interest(self.token);
            if self.shutting_down {
                self.do_shutdown();
            }
        }
        Ok(())
    }

    /// Requests shutdown; deferred while the send queue holds data.
    pub(crate) fn shut_down(&mut self) {
        self.shutting_down = true;
        if self.send_queue.is_none() {
            self.do_shutdown();
        }
    }

    /// Emits the TCP half-close. The peer answers by shutting down its
    /// side, which arrives as a zero-length read and finishes teardown.
    fn do_shutdown(&mut self) {
        if self.shutdown_sent {
            return;
        }
        self.shutdown_sent = true;
        if let Some(socket) = self.socket.as_mut() {
            if let Err(e) = socket.shutdown_write() {
                warn!(error = %e, "Half-close failed");
            }
        }
    }

    fn close(&mut self) {
        if self.send_queue.take().is_some() {
            self.dispatcher.cancel_write_interest(self.token);
        }
        self.socket = None;
        self.connected = false;
    }

    pub(crate) fn has_unsent_data(&self) -> bool {
        self.send_queue.is_some() || !self.cork_buf.is_empty()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected && self.socket.is_some()
    }

    pub(crate) fn is_peer_closed(&self) -> bool {
        self.peer_closed
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub(crate) fn descriptor(&self) -> String {
        match self.peer {
            Some(addr) => format!("tcp:{addr}"),
            None => "tcp:<unknown>".to_string(),
        }
    }
}

/// A TCP channel carrying length-prefixed frames, with an optional filter
/// chain and a bundle layer on top.
pub struct TcpChannel {
    core: Rc<RefCell<ChannelCore>>,
    /// Head of the filter chain; `None` means frames go straight to the
    /// socket.
    filter: Option<Box<dyn Stream>>,
    header_state: HeaderState,
    decoder: FrameDecoder,
    /// Deframed (and defiltered) bytes awaiting frame extraction.
    frame_data: BytesMut,
    /// The accumulating outgoing bundle.
    bundle: Bundle,
    requests: RequestTracker,
    interface: Rc<RefCell<dyn InterfaceTable>>,
    listener: Option<Box<dyn ChannelListener>>,
    config: ChannelConfig,
    counters: ChannelCounters,
    last_received: Instant,
    destroyed: bool,
}

impl TcpChannel {
    /// Creates the connection-initiating side of a channel. The preamble
    /// frame goes out ahead of the first data frame.
    pub fn client(
        socket: Box<dyn ChannelSocket>,
        dispatcher: Rc<dyn Dispatcher>,
        token: ChannelToken,
        config: ChannelConfig,
        interface: Rc<RefCell<dyn InterfaceTable>>,
    ) -> Self {
        Self::new(socket, dispatcher, token, config, interface, false)
    }

    /// Creates the accepting side of a channel. The first received frame
    /// must be the preamble.
    pub fn server(
        socket: Box<dyn ChannelSocket>,
        dispatcher: Rc<dyn Dispatcher>,
        token: ChannelToken,
        config: ChannelConfig,
        interface: Rc<RefCell<dyn InterfaceTable>>,
    ) -> Self {
        Self::new(socket, dispatcher, token, config, interface, true)
    }

    fn new(
        socket: Box<dyn ChannelSocket>,
        dispatcher: Rc<dyn Dispatcher>,
        token: ChannelToken,
        config: ChannelConfig,
        interface: Rc<RefCell<dyn InterfaceTable>>,
        is_server: bool,
    ) -> Self {
        let core = Rc::new(RefCell::new(ChannelCore::new(
            socket,
            dispatcher,
            token,
            config.nodelay,
        )));
        Self {
            core,
            filter: None,
            header_state: if is_server {
                HeaderState::ServerAwaitPreamble
            } else {
                HeaderState::ClientSendPreamble
            },
            decoder: FrameDecoder::new(config.max_frame_length),
            frame_data: BytesMut::new(),
            bundle: Bundle::new(),
            requests: RequestTracker::new(),
            interface,
            listener: None,
            config,
            counters: ChannelCounters::default(),
            last_received: Instant::now(),
            destroyed: false,
        }
    }

    pub fn set_listener(&mut self, listener: Box<dyn ChannelListener>) {
        self.listener = Some(listener);
    }

    /// Takes the current chain head, or makes a fresh adaptor when no
    /// filter has been installed yet.
    fn take_chain_bottom(&mut self) -> Box<dyn Stream> {
        match self.filter.take() {
            Some(filter) => filter,
            None => Box::new(ChannelStreamAdaptor::new(&self.core)),
        }
    }

    /// Installs a client-role WebSocket filter over the current chain.
    /// Install WebSocket before encryption so the ciphertext rides inside
    /// WebSocket frames.
    pub fn set_websocket_client(
        &mut self,
        host: &str,
        uri: &str,
        origin: Option<&str>,
    ) -> Result<()> {
        let below = self.take_chain_bottom();
        let filter =
            WebSocketFilter::client(below, host, uri, origin, self.config.max_frame_length)?;
        self.filter = Some(Box::new(filter));
        Ok(())
    }

    /// Installs a server-role WebSocket filter over the current chain.
    pub fn set_websocket_server(&mut self, handler: Box<dyn HandshakeHandler>) {
        let below = self.take_chain_bottom();
        let filter = WebSocketFilter::server(
            below,
            handler,
            self.config.max_handshake_length,
            self.config.max_frame_length,
        );
        self.filter = Some(Box::new(filter));
    }

    /// Installs an encryption filter on top of any pre-existing filter.
    pub fn set_encryption(&mut self, cipher: Box<dyn BlockCipher>) {
        let below = self.take_chain_bottom();
        self.filter = Some(Box::new(EncryptionFilter::new(below, cipher)));
    }

    /// Access to the accumulating outgoing bundle.
    pub fn bundle_mut(&mut self) -> &mut Bundle {
        &mut self.bundle
    }

    pub fn has_pending_messages(&self) -> bool {
        !self.bundle.is_empty()
    }

    /// Sends the accumulated bundle as one frame.
    pub fn send(&mut self) -> Result<()> {
        if self.destroyed {
            return Err(ProtocolError::ConnectionClosed);
        }
        if self.bundle.is_empty() {
            return Ok(());
        }

        let payload = self.bundle.finalize(&mut self.requests)?;

        if self.header_state == HeaderState::ClientSendPreamble {
            // First send from the client: the preamble goes out as its own
            // frame, corked so it shares a segment with the data frame.
            self.header_state = HeaderState::Done;
            let mut preamble = BytesMut::new();
            frame::encode_frame(PREAMBLE, &mut preamble);
            self.counters.frames_sent += 1;
            self.counters.bytes_sent += preamble.len() as u64;
            self.write_through_chain(preamble, WriteMode::Cork)?;
        }

        let mut frame = BytesMut::new();
        frame::encode_frame(&payload, &mut frame);
        self.counters.frames_sent += 1;
        self.counters.bytes_sent += frame.len() as u64;
        self.write_through_chain(frame, WriteMode::Uncork)
    }

    fn write_through_chain(&mut self, mut data: BytesMut, mode: WriteMode) -> Result<()> {
        let result = match self.filter.as_mut() {
            Some(filter) => filter.write_from(&mut data, mode),
            None => self.core.borrow_mut().write_from(&mut data, mode),
        };
        if let Err(e) = result {
            warn!(channel = self.descriptor().as_str(), error = %e, "Write error, destroying");
            self.destroy(DestroyReason::Error(e));
            return Err(ProtocolError::ConnectionClosed);
        }
        Ok(())
    }

    /// Entry point for readability notifications.
    pub fn handle_readable(&mut self) {
        if self.destroyed {
            return;
        }
        self.last_received = Instant::now();

        let read_result = match self.filter.as_mut() {
            Some(filter) => filter.read_into(&mut self.frame_data),
            None => self.core.borrow_mut().read_into(&mut self.frame_data),
        };
        if let Err(e) = read_result {
            error!(
                channel = self.descriptor().as_str(),
                error = %e,
                "Filter reported error while reading"
            );
            self.destroy(DestroyReason::Error(e));
            return;
        }

        self.process_frame_data();
        if self.destroyed {
            return;
        }

        if self.core.borrow().is_peer_closed() {
            self.handle_peer_disconnect();
        }
    }

    /// Extracts and dispatches every complete frame in the buffer.
    fn process_frame_data(&mut self) {
        loop {
            if self.header_state == HeaderState::ServerAwaitPreamble && !self.decoder.is_mid_frame()
            {
                if self.frame_data.len() < HTTP_HEADER_START.len() {
                    return; // wait for more data
                }
                if &self.frame_data[..HTTP_HEADER_START.len()] == HTTP_HEADER_START {
                    // A WebSocket client reached a raw channel; there is
                    // no handshake to answer here.
                    error!(
                        channel = self.descriptor().as_str(),
                        "First bytes look like an HTTP request on a raw channel"
                    );
                    self.destroy(DestroyReason::Error(ProtocolError::InvalidPreamble));
                    return;
                }
            }

            let frame = match self.decoder.decode(&mut self.frame_data) {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    error!(channel = self.descriptor().as_str(), error = %e, "Bad frame header");
                    self.destroy(DestroyReason::Error(e));
                    return;
                }
            };

            if self.header_state == HeaderState::ServerAwaitPreamble {
                if frame.as_ref() != PREAMBLE {
                    error!(
                        channel = self.descriptor().as_str(),
                        "Invalid preamble, disconnecting"
                    );
                    self.destroy(DestroyReason::Error(ProtocolError::InvalidPreamble));
                    return;
                }
                trace!(channel = self.descriptor().as_str(), "Preamble validated");
                self.header_state = HeaderState::Done;
                self.counters.frames_received += 1;
                self.counters.bytes_received += (2 + frame.len()) as u64;
                continue;
            }

            self.process_received_frame(frame);
            if self.destroyed {
                return;
            }
        }
    }

    /// Dispatches one complete frame through the bundle processor.
    fn process_received_frame(&mut self, frame: Bytes) {
        self.counters.frames_received += 1;
        self.counters.bytes_received +=
            (frame::header_size_for(frame.len()) + frame.len()) as u64;

        let processor = BundleProcessor::new(frame);
        let result = {
            let mut interface = self.interface.borrow_mut();
            processor.dispatch(&mut *interface, &mut self.requests, &mut self.bundle)
        };
        if let Err(e) = result {
            error!(
                channel = self.descriptor().as_str(),
                error = %e,
                "Error while dispatching messages"
            );
        }
    }

    /// Entry point for writability notifications.
    pub fn handle_writable(&mut self) {
        if self.destroyed {
            return;
        }
        let result = self.core.borrow_mut().send_buffered();
        if let Err(e) = result {
            error!(channel = self.descriptor().as_str(), error = %e, "Send failed, disconnecting");
            self.destroy(DestroyReason::Error(e));
        }
    }

    /// Entry point for the inactivity timer. The topmost filter gets the
    /// first chance to consume it; otherwise default handling tears the
    /// channel down.
    pub fn handle_inactivity_timeout(&mut self) {
        if self.destroyed {
            return;
        }
        if let Some(filter) = self.filter.as_mut() {
            if filter.did_handle_inactivity_timeout() {
                return;
            }
        }
        warn!(
            channel = self.descriptor().as_str(),
            "Channel inactive, destroying"
        );
        self.destroy(DestroyReason::InactivityTimeout);
    }

    /// Fails pending requests whose deadline has passed.
    pub fn expire_requests(&mut self, now: Instant) -> usize {
        self.requests.expire(now)
    }

    /// Cooperative shutdown: filters running a closing protocol defer the
    /// half-close until they finish.
    pub fn shut_down(&mut self) {
        if self.destroyed {
            return;
        }
        if let Some(filter) = self.filter.as_mut() {
            if !filter.did_finish_shutting_down() {
                // A filter wants to run its own closing protocol first;
                // it calls down again when that completes.
                return;
            }
        }
        self.core.borrow_mut().shut_down();
    }

    fn handle_peer_disconnect(&mut self) {
        if self.core.borrow().is_shutting_down() {
            debug!(channel = self.descriptor().as_str(), "Shutdown cleanly");
            self.destroy(DestroyReason::ShutdownComplete);
        } else {
            debug!(channel = self.descriptor().as_str(), "Disconnected by peer");
            self.destroy(DestroyReason::PeerDisconnect);
        }
    }

    /// Tears the channel down: drops the filter chain, closes the socket,
    /// fails pending requests and notifies the listener exactly once.
    pub fn destroy(&mut self, reason: DestroyReason) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.filter = None;
        self.core.borrow_mut().close();

        let error = match &reason {
            DestroyReason::Error(e) => ProtocolError::Custom(e.to_string()),
            _ => ProtocolError::ConnectionClosed,
        };
        self.requests.fail_all(&error);

        if let Some(listener) = self.listener.as_mut() {
            listener.on_channel_destroyed(&reason);
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn is_connected(&self) -> bool {
        if self.destroyed {
            return false;
        }
        match self.filter.as_ref() {
            Some(filter) => filter.is_connected(),
            None => self.core.borrow().is_connected(),
        }
    }

    pub fn has_unsent_data(&self) -> bool {
        if self.has_pending_messages() {
            return true;
        }
        match self.filter.as_ref() {
            Some(filter) => filter.has_unsent_data(),
            None => self.core.borrow().has_unsent_data(),
        }
    }

    pub fn counters(&self) -> ChannelCounters {
        self.counters
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn last_received(&self) -> Instant {
        self.last_received
    }

    pub fn descriptor(&self) -> String {
        match self.filter.as_ref() {
            Some(filter) => filter.descriptor(),
            None => self.core.borrow().descriptor(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::protocol::bundle::{LengthStyle, LengthWidth, MessageSpec};
    use crate::protocol::processor::testing::RecordingTable;
    use crate::transport::dispatcher::testing::RecordingDispatcher;
    use crate::transport::socket::testing::{IoStep, ScriptedSocket};

    fn chat_spec() -> MessageSpec {
        MessageSpec {
            id: 0x10,
            name: "chat",
            length: LengthStyle::Variable(LengthWidth::Two),
        }
    }

    struct Fixture {
        channel: TcpChannel,
        socket: ScriptedSocket,
        dispatcher: Rc<RecordingDispatcher>,
        table: RecordingTable,
    }

    fn fixture(is_server: bool) -> Fixture {
        let socket = ScriptedSocket::new();
        let dispatcher = RecordingDispatcher::new();
        let table = RecordingTable::new(&[chat_spec()]);
        let interface: Rc<RefCell<dyn InterfaceTable>> = Rc::new(RefCell::new(table.clone()));
        let make = if is_server {
            TcpChannel::server
        } else {
            TcpChannel::client
        };
        let channel = make(
            Box::new(socket.clone()),
            dispatcher.clone(),
            7,
            ChannelConfig::default(),
            interface,
        );
        Fixture {
            channel,
            socket,
            dispatcher,
            table,
        }
    }

    /// Wire bytes of a bundle frame holding one chat message.
    fn chat_frame(text: &[u8]) -> Vec<u8> {
        let mut bundle = Bundle::new();
        let mut tracker = RequestTracker::new();
        bundle.start_message(&chat_spec()).unwrap();
        bundle.append(text).unwrap();
        let payload = bundle.finalize(&mut tracker).unwrap();
        let mut framed = BytesMut::new();
        frame::encode_frame(&payload, &mut framed);
        framed.to_vec()
    }

    fn preamble_frame() -> Vec<u8> {
        let mut framed = BytesMut::new();
        frame::encode_frame(PREAMBLE, &mut framed);
        framed.to_vec()
    }

    #[derive(Clone, Default)]
    struct RecordingListener {
        reasons: Rc<RefCell<Vec<String>>>,
    }

    impl ChannelListener for RecordingListener {
        fn on_channel_destroyed(&mut self, reason: &DestroyReason) {
            self.reasons.borrow_mut().push(format!("{reason:?}"));
        }
    }

    #[test]
    fn client_first_send_carries_preamble() {
        let mut f = fixture(false);
        f.channel.bundle_mut().start_message(&chat_spec()).unwrap();
        f.channel.bundle_mut().append(b"hi").unwrap();
        f.channel.send().unwrap();

        let written = f.socket.written();
        let mut expected = preamble_frame();
        expected.extend_from_slice(&chat_frame(b"hi"));
        assert_eq!(written, expected);

        // Preamble goes out once only.
        f.channel.bundle_mut().start_message(&chat_spec()).unwrap();
        f.channel.bundle_mut().append(b"again").unwrap();
        f.channel.send().unwrap();
        let written = f.socket.written();
        assert_eq!(&written[expected.len()..], &chat_frame(b"again")[..]);
    }

    #[test]
    fn server_validates_preamble_then_dispatches() {
        let mut f = fixture(true);
        let mut wire = preamble_frame();
        wire.extend_from_slice(&chat_frame(b"hello"));
        f.socket.push_read(&wire);

        f.channel.handle_readable();
        assert!(!f.channel.is_destroyed());
        let seen = f.table.seen.borrow();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, b"hello");
    }

    #[test]
    fn server_rejects_http_client_on_raw_channel() {
        let mut f = fixture(true);
        let listener = RecordingListener::default();
        f.channel.set_listener(Box::new(listener.clone()));

        f.socket.push_read(b"GET /chat HTTP/1.1\r\n");
        f.channel.handle_readable();

        assert!(f.channel.is_destroyed());
        assert_eq!(listener.reasons.borrow().len(), 1);
        assert!(listener.reasons.borrow()[0].contains("InvalidPreamble"));
    }

    #[test]
    fn server_rejects_wrong_preamble() {
        let mut f = fixture(true);
        let mut framed = BytesMut::new();
        frame::encode_frame(b"UDP\r\n\r\n", &mut framed);
        f.socket.push_read(&framed);

        f.channel.handle_readable();
        assert!(f.channel.is_destroyed());
    }

    #[test]
    fn frames_split_across_reads_are_reassembled() {
        let mut f = fixture(true);
        let mut wire = preamble_frame();
        wire.extend_from_slice(&chat_frame(b"split me"));

        let mid = wire.len() / 2;
        f.socket.push_read(&wire[..mid]);
        f.channel.handle_readable();
        assert_eq!(f.table.seen.borrow().len(), 0);

        f.socket.push_read(&wire[mid..]);
        f.channel.handle_readable();
        assert_eq!(f.table.seen.borrow().len(), 1);
    }

    #[test]
    fn short_write_queues_and_retries_on_writability() {
        let mut f = fixture(false);
        f.socket.limit_next_write(3);
        f.socket.limit_next_write(0); // then the socket blocks

        f.channel.bundle_mut().start_message(&chat_spec()).unwrap();
        f.channel.bundle_mut().append(b"queued data").unwrap();
        f.channel.send().unwrap();

        assert_eq!(f.dispatcher.registered(), 1);
        assert!(f.channel.has_unsent_data());
        let partial = f.socket.written().len();
        assert_eq!(partial, 3);

        f.channel.handle_writable();
        assert_eq!(f.dispatcher.cancelled(), 1);
        assert!(!f.channel.has_unsent_data());

        let mut expected = preamble_frame();
        expected.extend_from_slice(&chat_frame(b"queued data"));
        assert_eq!(f.socket.written(), expected);
    }

    #[test]
    fn corked_writes_coalesce() {
        let f = fixture(false);
        let core = f.channel.core.clone();

        let mut first = BytesMut::from(&b"one"[..]);
        core.borrow_mut()
            .write_from(&mut first, WriteMode::Cork)
            .unwrap();
        assert!(f.socket.written().is_empty());
        assert!(core.borrow().has_unsent_data());

        let mut second = BytesMut::from(&b"two"[..]);
        core.borrow_mut()
            .write_from(&mut second, WriteMode::Uncork)
            .unwrap();
        assert_eq!(f.socket.written(), b"onetwo");
    }

    #[test]
    fn shutdown_defers_until_queue_drains() {
        let mut f = fixture(false);
        f.socket.limit_next_write(1);
        f.socket.limit_next_write(0); // then the socket blocks

        f.channel.bundle_mut().start_message(&chat_spec()).unwrap();
        f.channel.bundle_mut().append(b"flush first").unwrap();
        f.channel.send().unwrap();
        assert!(f.channel.has_unsent_data());

        f.channel.shut_down();
        assert_eq!(f.socket.shutdowns(), 0, "half-close must wait for the queue");

        f.channel.handle_writable();
        assert_eq!(f.socket.shutdowns(), 1);
    }

    #[test]
    fn peer_eof_destroys_and_notifies() {
        let mut f = fixture(true);
        let listener = RecordingListener::default();
        f.channel.set_listener(Box::new(listener.clone()));

        f.socket.push_eof();
        f.channel.handle_readable();

        assert!(f.channel.is_destroyed());
        assert!(!f.channel.is_connected());
        assert!(listener.reasons.borrow()[0].contains("PeerDisconnect"));
    }

    #[test]
    fn clean_shutdown_reported_after_half_close() {
        let mut f = fixture(false);
        let listener = RecordingListener::default();
        f.channel.set_listener(Box::new(listener.clone()));

        f.channel.shut_down();
        assert_eq!(f.socket.shutdowns(), 1);

        // Peer answers our FIN with its own close.
        f.socket.push_eof();
        f.channel.handle_readable();
        assert!(listener.reasons.borrow()[0].contains("ShutdownComplete"));
    }

    #[test]
    fn fatal_read_error_destroys() {
        let mut f = fixture(true);
        f.socket
            .state
            .borrow_mut()
            .reads
            .push_back(IoStep::Fatal(io::ErrorKind::ConnectionReset));
        f.channel.handle_readable();
        assert!(f.channel.is_destroyed());
    }

    #[test]
    fn would_block_reads_are_absorbed() {
        let mut f = fixture(true);
        f.socket.state.borrow_mut().reads.push_back(IoStep::Block);
        f.channel.handle_readable();
        assert!(!f.channel.is_destroyed());
    }

    #[test]
    fn destroy_fails_pending_requests_and_notifies_once() {
        let mut f = fixture(false);
        let listener = RecordingListener::default();
        f.channel.set_listener(Box::new(listener.clone()));

        let handler = crate::protocol::requests::testing::RecordingHandler::new();
        f.channel
            .bundle_mut()
            .start_request(&chat_spec(), Box::new(handler.clone()), None)
            .unwrap();
        f.channel.bundle_mut().append(b"?").unwrap();
        f.channel.send().unwrap();

        f.channel.destroy(DestroyReason::PeerDisconnect);
        f.channel.destroy(DestroyReason::PeerDisconnect);

        assert_eq!(listener.reasons.borrow().len(), 1);
        assert_eq!(handler.outcome.borrow().failures.len(), 1);
        assert!(f.channel.send().is_err());
    }

    #[test]
    fn oversized_frame_header_is_fatal() {
        let socket = ScriptedSocket::new();
        let dispatcher = RecordingDispatcher::new();
        let table = RecordingTable::new(&[chat_spec()]);
        let interface: Rc<RefCell<dyn InterfaceTable>> = Rc::new(RefCell::new(table));
        let config = ChannelConfig {
            max_frame_length: 1024,
            ..ChannelConfig::default()
        };
        let mut channel = TcpChannel::server(
            Box::new(socket.clone()),
            dispatcher,
            1,
            config,
            interface,
        );

        let mut wire = preamble_frame();
        wire.extend_from_slice(&[0xFF, 0xFF, 0x7F, 0xFF, 0xFF, 0xFF]); // absurd length
        socket.push_read(&wire);
        channel.handle_readable();
        assert!(channel.is_destroyed());
    }
}
