//! Periodic liveness probe.
//!
//! Every period the heartbeat writes one Ping frame to each registered
//! connection. A connection whose write fails (or stalls past the write
//! timeout) is dropped from the registry. The remaining connections are
//! still attempted.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::WriteFailure;
use crate::protocol::codec::encode_frame;
use crate::protocol::Envelope;
use crate::runtime::connection::{Connection, ConnectionRegistry};

/// Outcome of a single heartbeat firing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    /// Connections a write was attempted on.
    pub attempted: usize,
    /// Connections that accepted the ping.
    pub delivered: usize,
    /// Peer addresses removed from the registry.
    pub pruned: Vec<String>,
}

/// Heartbeat scheduler over a shared connection registry.
pub struct Heartbeat {
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    write_timeout: Duration,
}

impl Heartbeat {
    pub fn new(registry: Arc<ConnectionRegistry>, interval: Duration, write_timeout: Duration) -> Self {
        Self {
            registry,
            interval,
            write_timeout,
        }
    }

    /// Ping every registered connection once.
    pub async fn fire(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport::default();

        if self.registry.is_empty() {
            return report;
        }

        let frame = match encode_frame(&Envelope::ping()) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "Failed to encode ping");
                return report;
            }
        };

        for (peer, conn) in self.registry.snapshot() {
            report.attempted += 1;

            match self.send_ping(&conn, &frame).await {
                Ok(()) => report.delivered += 1,
                Err(failure) => {
                    warn!(peer = %peer, conn = %conn.id(), error = %failure.source, "Heartbeat write failed, dropping connection");
                    if self.registry.remove_connection(&conn) {
                        report.pruned.push(peer);
                    }
                }
            }
        }

        report
    }

    async fn send_ping(&self, conn: &Connection, frame: &Bytes) -> Result<(), WriteFailure> {
        let result = match tokio::time::timeout(self.write_timeout, conn.send(frame)).await {
            Ok(result) => result,
            Err(elapsed) => Err(elapsed.into()),
        };

        result.map_err(|source| WriteFailure {
            peer: conn.peer().to_string(),
            source,
        })
    }

    /// Start firing on a fixed period. The first firing happens one period
    /// from now.
    pub fn start(self) -> HeartbeatHandle {
        let (shutdown, cancelled) = watch::channel(false);

        info!(interval_ms = self.interval.as_millis() as u64, "Heartbeat started");
        let task = tokio::spawn(self.run(cancelled));

        HeartbeatHandle { shutdown, task }
    }

    async fn run(self, mut cancelled: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancelled.changed() => break,
            }

            let report = self.fire().await;
            if !report.pruned.is_empty() {
                info!(
                    delivered = report.delivered,
                    pruned = report.pruned.len(),
                    "Heartbeat pruned dead connections"
                );
            } else if report.attempted > 0 {
                debug!(delivered = report.delivered, "Heartbeat sent");
            }
        }

        debug!("Heartbeat stopped");
    }
}

/// Handle to a running heartbeat.
pub struct HeartbeatHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop future firings. A firing already in progress runs to completion
    /// before this returns.
    pub async fn cancel(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!(error = %e, "Heartbeat task failed");
        }
    }
}
