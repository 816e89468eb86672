//! Tokio-driven channel setup (Unix).
//!
//! The channel itself is synchronous state-machine code; this module is
//! the embedder that owns the event loop. Each connection's socket is
//! shared between the channel (non-blocking I/O) and an [`AsyncFd`]
//! registration (readiness), with a [`WriteInterestCell`] as the
//! dispatcher so queued sends add WRITABLE interest to the next readiness
//! await.
//!
//! Channels hold `Rc` state and are not `Send`; [`start_server`] drives
//! its connections on a [`LocalSet`].

use std::cell::RefCell;
use std::net::TcpStream as StdTcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::LocalSet;
use tracing::{debug, error, info};

use crate::config::ChannelConfig;
use crate::error::Result;
use crate::protocol::processor::InterfaceTable;
use crate::transport::dispatcher::{Dispatcher, WriteInterestCell};
use crate::transport::tcp::TcpChannel;

/// `AsRawFd` view of the shared socket for reactor registration.
struct SharedFd(Arc<StdTcpStream>);

impl AsRawFd for SharedFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

/// One driven connection: the channel plus its readiness registration.
pub struct Connection {
    channel: TcpChannel,
    ready: AsyncFd<SharedFd>,
    interest: Rc<WriteInterestCell>,
}

impl Connection {
    fn wrap(
        stream: TcpStream,
        config: ChannelConfig,
        interface: Rc<RefCell<dyn InterfaceTable>>,
        is_server: bool,
    ) -> Result<Self> {
        let std_stream = stream.into_std()?;
        std_stream.set_nonblocking(true)?;
        let shared = Arc::new(std_stream);

        let interest = WriteInterestCell::new();
        let dispatcher: Rc<dyn Dispatcher> = interest.clone();
        let token = shared.as_raw_fd() as u64;

        let make = if is_server {
            TcpChannel::server
        } else {
            TcpChannel::client
        };
        let channel = make(Box::new(shared.clone()), dispatcher, token, config, interface);

        let ready = AsyncFd::new(SharedFd(shared))?;
        Ok(Self {
            channel,
            ready,
            interest,
        })
    }

    pub fn channel(&self) -> &TcpChannel {
        &self.channel
    }

    pub fn channel_mut(&mut self) -> &mut TcpChannel {
        &mut self.channel
    }

    /// Pumps readiness events into the channel until it is destroyed.
    ///
    /// A one-second tick expires pending requests and checks the
    /// inactivity timeout; batched replies are flushed after every read
    /// pass.
    pub async fn drive(&mut self) -> Result<()> {
        while !self.channel.is_destroyed() {
            let interest = if self.interest.wants_write() {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            tokio::select! {
                ready = self.ready.ready(interest) => {
                    let mut guard = ready?;
                    if guard.ready().is_readable() {
                        self.channel.handle_readable();
                    }
                    if guard.ready().is_writable() {
                        self.channel.handle_writable();
                    }
                    guard.clear_ready();

                    if !self.channel.is_destroyed() && self.channel.has_pending_messages() {
                        let _ = self.channel.send();
                    }
                }
                _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => {
                    self.channel.expire_requests(Instant::now());
                    if let Some(timeout) = self.channel.config().inactivity_timeout {
                        if self.channel.last_received().elapsed() >= timeout {
                            self.channel.handle_inactivity_timeout();
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Connects to a raw-protocol server and wraps the socket in a
/// client-role channel.
pub async fn connect<A: ToSocketAddrs>(
    addr: A,
    config: ChannelConfig,
    interface: Rc<RefCell<dyn InterfaceTable>>,
) -> Result<Connection> {
    let stream = TcpStream::connect(addr).await?;
    if let Ok(peer) = stream.peer_addr() {
        debug!(%peer, "Connected");
    }
    Connection::wrap(stream, config, interface, false)
}

/// Accepts one connection and wraps it in a server-role channel.
pub async fn accept(
    listener: &TcpListener,
    config: ChannelConfig,
    interface: Rc<RefCell<dyn InterfaceTable>>,
) -> Result<Connection> {
    let (stream, peer) = listener.accept().await?;
    debug!(%peer, "Accepted connection");
    Connection::wrap(stream, config, interface, true)
}

/// Accept loop with graceful CTRL+C shutdown, in the shape embedders
/// usually want: one interface table and one setup pass (install filters,
/// listener) per accepted channel.
pub async fn start_server<I, S>(
    address: &str,
    config: ChannelConfig,
    interface_factory: I,
    mut setup: S,
) -> Result<()>
where
    I: Fn() -> Rc<RefCell<dyn InterfaceTable>>,
    S: FnMut(&mut TcpChannel) -> Result<()>,
{
    let listener = TcpListener::bind(address).await?;
    info!(%address, "Listening");

    let local = LocalSet::new();
    local
        .run_until(async {
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received CTRL+C signal, shutting down");
                        return Ok(());
                    }
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                error!(error = %e, "Error accepting connection");
                                continue;
                            }
                        };
                        debug!(%peer, "New connection");

                        let mut connection = match Connection::wrap(
                            stream,
                            config.clone(),
                            interface_factory(),
                            true,
                        ) {
                            Ok(connection) => connection,
                            Err(e) => {
                                error!(error = %e, %peer, "Failed to set up channel");
                                continue;
                            }
                        };

                        if let Err(e) = setup(connection.channel_mut()) {
                            error!(error = %e, %peer, "Channel setup failed");
                            continue;
                        }

                        tokio::task::spawn_local(async move {
                            if let Err(e) = connection.drive().await {
                                error!(error = %e, "Connection driver failed");
                            }
                        });
                    }
                }
            }
        })
        .await
}
