//! Hand-off queue between connection handling and the message consumer.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::error::QueueError;
use crate::protocol::Envelope;

/// Unbounded FIFO of decoded envelopes.
///
/// Producers never block and nothing is dropped. Draining fast enough is
/// the consumer's job.
#[derive(Debug, Default)]
pub struct InboundQueue {
    pending: Mutex<VecDeque<Envelope>>,
    available: Notify,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<Envelope>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an envelope, taking ownership of it.
    pub fn push(&self, envelope: Envelope) {
        self.pending().push_back(envelope);
        self.available.notify_one();
    }

    /// Current queue depth.
    pub fn pop_count(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Take the oldest envelope.
    pub fn pop(&self) -> Result<Envelope, QueueError> {
        self.pending().pop_front().ok_or(QueueError::Empty)
    }

    /// Wait until an envelope is available and take it.
    pub async fn recv(&self) -> Envelope {
        loop {
            if let Ok(envelope) = self.pop() {
                return envelope;
            }
            self.available.notified().await;
        }
    }
}
