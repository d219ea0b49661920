//! TCP server: accepts connections, decodes their first frame, and keeps
//! them alive with a heartbeat.
//!
//! A [`Server`] owns the shared registry and inbound queue. Starting it
//! binds the listener and spawns two tasks, the accept loop and the
//! heartbeat, both of which receive their collaborators explicitly.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{AcceptMode, Config};
use crate::error::{FrameError, FrameResult, ServerError};
use crate::protocol::codec::read_envelope;
use crate::protocol::Envelope;
use crate::runtime::{
    Connection, ConnectionId, ConnectionRegistry, Heartbeat, HeartbeatHandle, InboundQueue, Listener,
};

/// Buffered faults per subscriber before the slowest one starts lagging.
const FAULT_CHANNEL_CAPACITY: usize = 256;

/// A connection whose frame could not be read or decoded.
///
/// The connection stays registered; subscribers decide what to do with it.
#[derive(Debug, Clone)]
pub struct FrameFault {
    pub peer: String,
    pub connection: ConnectionId,
    pub error: Arc<FrameError>,
}

/// Server instance
pub struct Server {
    config: Config,
    registry: Arc<ConnectionRegistry>,
    queue: Arc<InboundQueue>,
}

impl Server {
    /// Create a new server with its own registry and queue
    pub fn new(config: Config) -> Self {
        Self::with_collaborators(
            config,
            Arc::new(ConnectionRegistry::new()),
            Arc::new(InboundQueue::new()),
        )
    }

    /// Create a server around an existing registry and queue
    pub fn with_collaborators(
        config: Config,
        registry: Arc<ConnectionRegistry>,
        queue: Arc<InboundQueue>,
    ) -> Self {
        Self {
            config,
            registry,
            queue,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<InboundQueue> {
        &self.queue
    }

    /// Bind, listen, and spawn the accept loop and heartbeat.
    ///
    /// Must be called from within a tokio runtime. Bind and listen failures
    /// are fatal and returned as-is.
    pub fn start(self) -> Result<ServerHandle, ServerError> {
        let mut listener = Listener::new(self.config.listen_addr(), self.config.backlog);
        listener.bind()?;
        listener.listen()?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::ListenFailure { source })?;

        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let acceptor = Arc::new(Acceptor {
            registry: Arc::clone(&self.registry),
            queue: Arc::clone(&self.queue),
            faults: faults.clone(),
            read_timeout: self.config.read_timeout,
        });
        let accept_task = tokio::spawn(accept_loop(
            listener,
            acceptor,
            self.config.accept_mode,
            shutdown_rx,
        ));

        let heartbeat = Heartbeat::new(
            Arc::clone(&self.registry),
            self.config.heartbeat_interval,
            self.config.write_timeout,
        )
        .start();

        info!(address = %local_addr, accept_mode = ?self.config.accept_mode, "Server listening");

        Ok(ServerHandle {
            local_addr,
            registry: self.registry,
            queue: self.queue,
            faults,
            shutdown,
            accept_task,
            heartbeat,
        })
    }
}

/// Handle to a running server.
pub struct ServerHandle {
    local_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    queue: Arc<InboundQueue>,
    faults: broadcast::Sender<FrameFault>,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    heartbeat: HeartbeatHandle,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<InboundQueue> {
        &self.queue
    }

    /// Subscribe to per-connection frame faults raised from now on.
    pub fn faults(&self) -> broadcast::Receiver<FrameFault> {
        self.faults.subscribe()
    }

    /// Stop accepting, close the listening socket, and cancel the heartbeat.
    ///
    /// Accepted connections stay open. In inline mode a first-frame read
    /// already in progress is moved to its own task and left to finish;
    /// this never waits on a peer.
    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.accept_task.await {
            error!(error = %e, "Accept task failed");
        }
        self.heartbeat.cancel().await;
        info!(address = %self.local_addr, "Server closed");
    }
}

/// Everything the accept path needs to register and decode a connection.
struct Acceptor {
    registry: Arc<ConnectionRegistry>,
    queue: Arc<InboundQueue>,
    faults: broadcast::Sender<FrameFault>,
    read_timeout: Option<Duration>,
}

impl Acceptor {
    /// Register a new connection and hand its first envelope to the queue.
    async fn handle(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let peer = addr.to_string();
        let (mut reader, writer) = stream.into_split();

        let conn = Arc::new(Connection::new(peer.clone(), writer));
        if let Some(previous) = self.registry.insert(Arc::clone(&conn)) {
            debug!(peer = %peer, previous = %previous.id(), "Replaced registry entry");
        }

        match self.read_first(&mut reader).await {
            Ok(envelope) => {
                trace!(peer = %peer, kind = ?envelope.kind(), len = envelope.payload().len(), "Frame decoded");
                self.queue.push(envelope);
            }
            Err(e) => {
                warn!(peer = %peer, conn = %conn.id(), error = %e, "Failed to read frame");
                let _ = self.faults.send(FrameFault {
                    peer,
                    connection: conn.id(),
                    error: Arc::new(e),
                });
            }
        }
    }

    async fn read_first(&self, reader: &mut OwnedReadHalf) -> FrameResult<Envelope> {
        match self.read_timeout {
            Some(limit) => tokio::time::timeout(limit, read_envelope(reader))
                .await
                .map_err(|_| FrameError::TimedOut)?,
            None => read_envelope(reader).await,
        }
    }
}

async fn accept_loop(
    mut listener: Listener,
    acceptor: Arc<Acceptor>,
    mode: AcceptMode,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "New connection");

                let work = Arc::clone(&acceptor).handle(stream, addr);
                match mode {
                    AcceptMode::Inline => {
                        let mut work = Box::pin(work);
                        tokio::select! {
                            biased;
                            _ = &mut work => {}
                            _ = shutdown.changed() => {
                                listener.close();
                                debug!(peer = %addr, "Detaching in-flight read on shutdown");
                                tokio::spawn(work);
                                return;
                            }
                        }
                    }
                    AcceptMode::Spawned => {
                        tokio::spawn(work);
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
            }
        }
    }

    listener.close();
}
