//! Listening socket lifecycle.
//!
//! ```text
//! Uninitialized --bind--> Bound --listen--> Listening --close--> Closed
//!        \                   \
//!         `-----------------> Failed
//! ```
//!
//! Any failure while binding or listening releases the socket and leaves
//! the listener in `Failed`. There is no retry.

use std::fmt;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::error::ServerError;

/// Lifecycle state of a [`Listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Uninitialized,
    Bound,
    Listening,
    Closed,
    Failed,
}

impl ListenerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListenerState::Uninitialized => "uninitialized",
            ListenerState::Bound => "bound",
            ListenerState::Listening => "listening",
            ListenerState::Closed => "closed",
            ListenerState::Failed => "failed",
        }
    }
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// TCP listener with keep-alive and address reuse enabled.
pub struct Listener {
    addr: SocketAddrV4,
    backlog: i32,
    state: ListenerState,
    socket: Option<Socket>,
    listener: Option<TcpListener>,
}

impl Listener {
    pub fn new(addr: SocketAddrV4, backlog: i32) -> Self {
        Self {
            addr,
            backlog,
            state: ListenerState::Uninitialized,
            socket: None,
            listener: None,
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    fn expect_state(&self, expected: ListenerState) -> Result<(), ServerError> {
        if self.state != expected {
            return Err(ServerError::InvalidState {
                expected: expected.as_str(),
                actual: self.state.as_str(),
            });
        }
        Ok(())
    }

    fn fail(&mut self) {
        self.socket = None;
        self.listener = None;
        self.state = ListenerState::Failed;
    }

    /// Create the socket, set its options, and bind it.
    pub fn bind(&mut self) -> Result<(), ServerError> {
        self.expect_state(ListenerState::Uninitialized)?;

        match create_bound_socket(self.addr) {
            Ok(socket) => {
                debug!(addr = %self.addr, "Socket bound");
                self.socket = Some(socket);
                self.state = ListenerState::Bound;
                Ok(())
            }
            Err(source) => {
                self.fail();
                Err(ServerError::BindFailure {
                    addr: SocketAddr::V4(self.addr),
                    source,
                })
            }
        }
    }

    /// Mark the bound socket passive and hand it to the tokio reactor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn listen(&mut self) -> Result<(), ServerError> {
        self.expect_state(ListenerState::Bound)?;

        let Some(socket) = self.socket.take() else {
            self.fail();
            return Err(ServerError::InvalidState {
                expected: ListenerState::Bound.as_str(),
                actual: ListenerState::Failed.as_str(),
            });
        };

        match start_listening(socket, self.backlog) {
            Ok(listener) => {
                info!(addr = %self.addr, backlog = self.backlog, "Listening");
                self.listener = Some(listener);
                self.state = ListenerState::Listening;
                Ok(())
            }
            Err(source) => {
                self.fail();
                Err(ServerError::ListenFailure { source })
            }
        }
    }

    /// Address actually bound, which differs from the configured one when
    /// the configured port is 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return listener.local_addr();
        }
        if let Some(socket) = &self.socket {
            return socket
                .local_addr()?
                .as_socket()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "not an inet socket"));
        }
        Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "listener is not bound",
        ))
    }

    /// Wait for the next incoming connection.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        match &self.listener {
            Some(listener) => listener.accept().await,
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "listener is not listening",
            )),
        }
    }

    /// Close the listening socket. Accepted connections are left alone.
    pub fn close(&mut self) {
        if matches!(self.state, ListenerState::Closed | ListenerState::Failed) {
            warn!(state = %self.state, "Close on inactive listener ignored");
            return;
        }
        self.socket = None;
        self.listener = None;
        self.state = ListenerState::Closed;
        info!(addr = %self.addr, "Listener closed");
    }
}

fn create_bound_socket(addr: SocketAddrV4) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_keepalive(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;

    Ok(socket)
}

fn start_listening(socket: Socket, backlog: i32) -> io::Result<TcpListener> {
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}
