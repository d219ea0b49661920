//! heartwire server binary.
//!
//! Starts the listener and heartbeat, then drains the inbound queue,
//! logging each envelope, until interrupted.

use std::sync::Arc;

use heartwire::{Config, InboundQueue, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        backlog = config.backlog,
        accept_mode = ?config.accept_mode,
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        "Starting heartwire server"
    );

    let handle = Server::new(config).start()?;
    let consumer = tokio::spawn(drain(Arc::clone(handle.queue())));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    consumer.abort();
    handle.close().await;
    Ok(())
}

/// Stand-in consumer: log every envelope as it arrives.
async fn drain(queue: Arc<InboundQueue>) {
    loop {
        let envelope = queue.recv().await;
        let kind = envelope.kind();
        let payload = envelope.into_payload();
        info!(
            kind = ?kind,
            bytes = payload.len(),
            pending = queue.pop_count(),
            "Received envelope"
        );
    }
}
