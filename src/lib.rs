//! heartwire: a TCP listener for length-prefixed protobuf envelopes.
//!
//! Accepted connections are registered by peer address and their first
//! frame is decoded into an [`Envelope`] and queued for a consumer. A
//! heartbeat pings every registered connection on a fixed period and drops
//! those that can no longer be written to.

pub mod config;
pub mod error;
pub mod protocol;
pub mod runtime;
pub mod server;

pub use config::{AcceptMode, Config};
pub use error::{FrameError, QueueError, ServerError, WriteFailure};
pub use protocol::{Envelope, MessageKind};
pub use runtime::{Connection, ConnectionRegistry, InboundQueue};
pub use server::{FrameFault, Server, ServerHandle};
