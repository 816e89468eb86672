//! Non-blocking socket contract for the transport channel.
//!
//! The channel only needs try-semantics reads and writes plus a write-side
//! half-close; anything satisfying that can sit under a channel, which is
//! how the tests substitute scripted sockets for real TCP.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;

/// Capability set the channel requires of its socket.
///
/// Implementations must be non-blocking: a read or write that cannot
/// proceed returns `io::ErrorKind::WouldBlock` rather than blocking the
/// event-loop thread.
pub trait ChannelSocket {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Emits the TCP half-close (FIN) on the send direction.
    fn shutdown_write(&mut self) -> io::Result<()>;

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()>;
}

impl ChannelSocket for TcpStream {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write(buf)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }
}

/// Shared handle to a non-blocking `TcpStream`.
///
/// The drive loop in [`crate::transport::net`] keeps one clone registered
/// with the reactor for readiness while the channel owns another for I/O;
/// `std` implements `Read`/`Write` for `&TcpStream`, so both sides can use
/// the socket without interior locking.
impl ChannelSocket for Arc<TcpStream> {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&**self).read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&**self).write(buf)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn set_nodelay(&mut self, nodelay: bool) -> io::Result<()> {
        TcpStream::set_nodelay(self, nodelay)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted socket double used by the channel unit tests.

    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    use super::*;

    /// One scripted outcome for a read or write attempt.
    pub enum IoStep {
        /// Accept up to this many bytes (write) or deliver these bytes (read).
        Data(Vec<u8>),
        /// Report `WouldBlock`.
        Block,
        /// Report end of stream (read side only).
        Eof,
        /// Report a fatal error.
        Fatal(io::ErrorKind),
    }

    #[derive(Default)]
    pub struct ScriptedSocketState {
        pub reads: VecDeque<IoStep>,
        /// Byte budget granted to each successive write call; when the
        /// queue is empty writes accept everything.
        pub write_budgets: VecDeque<usize>,
        pub written: Vec<u8>,
        pub shutdowns: usize,
    }

    #[derive(Clone, Default)]
    pub struct ScriptedSocket {
        pub state: Rc<RefCell<ScriptedSocketState>>,
    }

    impl ScriptedSocket {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_read(&self, bytes: &[u8]) {
            self.state
                .borrow_mut()
                .reads
                .push_back(IoStep::Data(bytes.to_vec()));
        }

        pub fn push_eof(&self) {
            self.state.borrow_mut().reads.push_back(IoStep::Eof);
        }

        pub fn limit_next_write(&self, budget: usize) {
            self.state.borrow_mut().write_budgets.push_back(budget);
        }

        pub fn written(&self) -> Vec<u8> {
            self.state.borrow().written.clone()
        }

        pub fn shutdowns(&self) -> usize {
            self.state.borrow().shutdowns
        }
    }

    impl ChannelSocket for ScriptedSocket {
        fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut state = self.state.borrow_mut();
            match state.reads.pop_front() {
                Some(IoStep::Data(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    if n < bytes.len() {
                        state.reads.push_front(IoStep::Data(bytes[n..].to_vec()));
                    }
                    Ok(n)
                }
                Some(IoStep::Eof) => Ok(0),
                Some(IoStep::Fatal(kind)) => Err(io::Error::from(kind)),
                Some(IoStep::Block) | None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
            }
        }

        fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut state = self.state.borrow_mut();
            let n = match state.write_budgets.pop_front() {
                Some(0) => return Err(io::Error::from(io::ErrorKind::WouldBlock)),
                Some(budget) => budget.min(buf.len()),
                None => buf.len(),
            };
            state.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn shutdown_write(&mut self) -> io::Result<()> {
            self.state.borrow_mut().shutdowns += 1;
            Ok(())
        }

        fn peer_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn set_nodelay(&mut self, _nodelay: bool) -> io::Result<()> {
            Ok(())
        }
    }
}
