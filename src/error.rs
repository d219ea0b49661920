//! Error types for the listener, the frame codec, and the shared queues.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors produced while reading or writing a single frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The look-ahead window does not hold a decodable length prefix,
    /// or the re-parsed prefix disagrees with the declared length.
    #[error("malformed length prefix")]
    MalformedHeader,

    /// The stream closed before the whole frame arrived.
    #[error("stream closed after {received} of {expected} frame bytes")]
    ShortRead {
        /// Bytes the frame required.
        expected: usize,
        /// Bytes actually received.
        received: usize,
    },

    /// The payload bytes are not a valid envelope.
    #[error("envelope decode failed: {0}")]
    DecodeFailure(#[from] prost::DecodeError),

    #[error("envelope encode failed: {0}")]
    Encode(#[from] prost::EncodeError),

    /// The envelope carried a message kind this server does not know.
    #[error("unknown message kind {0}")]
    UnknownKind(i32),

    /// The envelope is too large for a 4-byte length prefix.
    #[error("envelope of {len} bytes exceeds the 4-byte prefix ceiling")]
    FrameTooLarge {
        /// Encoded envelope length.
        len: usize,
    },

    /// The first frame did not arrive within the configured read timeout.
    #[error("timed out waiting for frame")]
    TimedOut,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Fatal errors raised while bringing the listener up.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    BindFailure {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to listen: {source}")]
    ListenFailure {
        #[source]
        source: io::Error,
    },

    /// A lifecycle operation was attempted from the wrong state.
    #[error("listener is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
}

/// A heartbeat write to one connection failed or stalled.
#[derive(Debug, Error)]
#[error("write to {peer} failed: {source}")]
pub struct WriteFailure {
    pub peer: String,
    #[source]
    pub source: io::Error,
}

/// Errors returned by the inbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    #[error("inbound queue is empty")]
    Empty,
}

pub type FrameResult<T> = Result<T, FrameError>;
