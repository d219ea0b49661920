//! Connection runtime.
//!
//! Shared pieces used by the accept path and the heartbeat:
//! - `Listener`: listening socket lifecycle
//! - `ConnectionRegistry`: live connections keyed by peer address
//! - `InboundQueue`: decoded envelopes waiting for a consumer
//! - `Heartbeat`: periodic ping broadcast that prunes dead connections

mod connection;
mod heartbeat;
mod listener;
mod queue;

pub use connection::{Connection, ConnectionId, ConnectionRegistry};
pub use heartbeat::{Heartbeat, HeartbeatHandle, HeartbeatReport};
pub use listener::{Listener, ListenerState};
pub use queue::InboundQueue;
