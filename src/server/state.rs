//! Shared server state
//!
//! One `ServerState` is created per server and handed to the acceptor and to
//! every session as an `Arc`. It owns the registry, the broadcaster and the
//! transcript; nothing in the crate keeps these in globals.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use tracing::warn;

use crate::ServerConfig;
use crate::protocol::ChatEvent;
use crate::server::broadcast::{BroadcastReport, Broadcaster};
use crate::server::registry::Registry;
use crate::transcript::Transcript;

#[derive(Debug)]
pub struct ServerState {
    pub(crate) config: ServerConfig,
    registry: Arc<Registry>,
    broadcaster: Broadcaster,
    transcript: Transcript,
    /// Accepted connections whose session has not finished yet
    live_connections: AtomicUsize,
}

impl ServerState {
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let transcript = Transcript::new(config.transcript_path.clone());

        Self {
            config,
            registry,
            broadcaster,
            transcript,
            live_connections: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// Broadcast an event, then append the same line to the transcript.
    ///
    /// A transcript failure is logged and otherwise ignored.
    pub async fn publish(&self, event: ChatEvent) -> BroadcastReport {
        let line = event.render();
        let report = self.broadcaster.broadcast(&line).await;

        // Appended after the sequencing lock is released: the transcript keeps
        // each sender's order, but lines from different senders may land in a
        // different order than on the wire.
        if let Err(e) = self.transcript.log(line.as_str()).await {
            warn!("Transcript append failed: {}", e);
        }

        report
    }

    /// Reserve a connection slot, or `false` when the server is full
    pub(crate) fn try_acquire_slot(&self) -> bool {
        let max = self.config.max_connections;
        self.live_connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .is_ok()
    }

    pub(crate) fn release_slot(&self) {
        self.live_connections.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::Acquire)
    }

    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            connected_clients: self.live_connections(),
            joined_clients: self.registry.len().await,
            broadcasts: self.broadcaster.issued().await,
            max_connections: self.config.max_connections,
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    pub connected_clients: usize,
    pub joined_clients: usize,
    pub broadcasts: u64,
    pub max_connections: usize,
}
