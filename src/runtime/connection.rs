//! Live connections and the registry that tracks them.
//!
//! The registry is shared between the accept path, which inserts freshly
//! accepted connections, and the heartbeat, which writes to every entry and
//! drops the ones that fail.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identity of an accepted stream, independent of its peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Handle to the write side of an open connection.
///
/// The stream closes once the last handle is dropped.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    writer: AsyncMutex<BoxedWriter>,
}

impl Connection {
    pub fn new<W>(peer: impl Into<String>, writer: W) -> Self
    where
        W: AsyncWrite + Send + 'static,
    {
        Self {
            id: ConnectionId::next(),
            peer: peer.into(),
            writer: AsyncMutex::new(Box::pin(writer)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Peer address, used as the registry key.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write a whole buffer and flush it.
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await
    }

    /// Shut down the write side of the stream.
    pub async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Registry of live connections keyed by peer address.
///
/// Every operation holds the same lock, so a snapshot never sees a table
/// in the middle of a mutation.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<String, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, Arc<Connection>>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection under its peer address.
    ///
    /// Replaces and returns any previous entry for that address. The
    /// replaced connection is not closed; that is up to the caller.
    pub fn insert(&self, conn: Arc<Connection>) -> Option<Arc<Connection>> {
        self.table().insert(conn.peer().to_string(), conn)
    }

    /// Remove the entry for an address. Missing addresses are ignored.
    pub fn remove(&self, peer: &str) -> Option<Arc<Connection>> {
        self.table().remove(peer)
    }

    /// Remove `conn` only if its address still maps to this very connection.
    ///
    /// Returns `false` when the address is absent or has been taken over by
    /// a newer connection.
    pub fn remove_connection(&self, conn: &Connection) -> bool {
        let mut table = self.table();
        match table.get(conn.peer()) {
            Some(current) if current.id() == conn.id() => {
                table.remove(conn.peer());
                true
            }
            _ => false,
        }
    }

    /// Get the connection registered for an address.
    pub fn get(&self, peer: &str) -> Option<Arc<Connection>> {
        self.table().get(peer).cloned()
    }

    pub fn contains(&self, peer: &str) -> bool {
        self.table().contains_key(peer)
    }

    /// Copy of the current entries, safe to iterate while the table changes.
    pub fn snapshot(&self) -> Vec<(String, Arc<Connection>)> {
        self.table()
            .iter()
            .map(|(peer, conn)| (peer.clone(), Arc::clone(conn)))
            .collect()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}
