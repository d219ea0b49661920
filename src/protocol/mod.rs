//! Envelope protocol.
//!
//! Every message on the wire is a protobuf `WireEnvelope`: a message kind
//! tag plus an opaque payload whose schema belongs to the application.
//!
//! ```text
//! message WireEnvelope { MessageKind kind = 1; bytes payload = 2; }
//! enum MessageKind { UNSPECIFIED = 0; PING = 1; DATA = 2; }
//! message Ping {}
//! ```
//!
//! The server only interprets `PING`, which it broadcasts as a liveness
//! probe. Everything else is handed to the consumer untouched.

pub mod codec;

use bytes::Bytes;
use prost::Message;

use crate::error::{FrameError, FrameResult};

/// Message kind tag carried by every envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageKind {
    Unspecified = 0,
    Ping = 1,
    Data = 2,
}

/// Body of a heartbeat probe. Currently carries no fields.
#[derive(Clone, PartialEq, Message)]
pub struct Ping {}

/// Protobuf representation of an envelope as it appears on the wire.
#[derive(Clone, PartialEq, Message)]
pub(crate) struct WireEnvelope {
    #[prost(enumeration = "MessageKind", tag = "1")]
    pub kind: i32,
    #[prost(bytes = "bytes", tag = "2")]
    pub payload: Bytes,
}

/// A decoded protocol message.
///
/// Immutable once built. Ownership moves from the decoder into the inbound
/// queue and from there to whoever pops it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    kind: MessageKind,
    payload: Bytes,
}

impl Envelope {
    pub fn new(kind: MessageKind, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            payload: payload.into(),
        }
    }

    /// A `Data` envelope wrapping an application payload.
    pub fn data(payload: impl Into<Bytes>) -> Self {
        Self::new(MessageKind::Data, payload)
    }

    /// The heartbeat probe broadcast to every connection.
    pub fn ping() -> Self {
        Self::new(MessageKind::Ping, Ping {}.encode_to_vec())
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the envelope, yielding its payload.
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    pub(crate) fn to_wire(&self) -> WireEnvelope {
        WireEnvelope {
            kind: self.kind as i32,
            payload: self.payload.clone(),
        }
    }

    pub(crate) fn from_wire(wire: WireEnvelope) -> FrameResult<Self> {
        match MessageKind::try_from(wire.kind) {
            Ok(MessageKind::Unspecified) | Err(_) => Err(FrameError::UnknownKind(wire.kind)),
            Ok(kind) => Ok(Self {
                kind,
                payload: wire.payload,
            }),
        }
    }
}
