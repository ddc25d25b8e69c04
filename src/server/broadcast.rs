//! Broadcast engine
//!
//! Fans one formatted line out to every joined connection. Calls are
//! serialized by a sequencing lock held across snapshot and enqueue, so every
//! recipient observes broadcasts in submission order. Enqueueing never waits:
//! a recipient whose queue is full or closed is closed and evicted from the
//! registry, and delivery to everyone else carries on.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::protocol::Broadcast;
use crate::server::registry::Registry;
use crate::transport::ConnectionId;

/// Outcome of one broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Position of this broadcast in the global order, starting at 1
    pub sequence: u64,
    /// Recipients whose queue accepted the line
    pub delivered: usize,
    /// Recipients that were closed and deregistered
    pub evicted: Vec<ConnectionId>,
}

/// Delivers lines to everyone in the registry
#[derive(Debug)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    /// Held for the whole fan-out; counts broadcasts issued so far
    sequence: Mutex<u64>,
}

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            sequence: Mutex::new(0),
        }
    }

    /// Deliver `message` to every connection currently registered.
    ///
    /// Lock order: sequence lock, then registry lock. The registry lock is
    /// never held while waiting on anything else.
    pub async fn broadcast(&self, message: &Broadcast) -> BroadcastReport {
        let mut sequence = self.sequence.lock().await;
        *sequence += 1;

        let mut report = BroadcastReport {
            sequence: *sequence,
            ..Default::default()
        };

        for entry in self.registry.snapshot().await {
            match entry.connection.try_enqueue(message.bytes().clone()) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        "Dropping recipient \"{}\" at {}: {}",
                        entry.nickname,
                        entry.connection.remote_addr(),
                        e
                    );
                    entry.connection.close();
                    self.registry.remove(entry.connection.id()).await;
                    report.evicted.push(entry.connection.id());
                }
            }
        }

        debug!(
            "Broadcast #{} delivered to {} recipient(s), evicted {}",
            report.sequence,
            report.delivered,
            report.evicted.len()
        );
        report
    }

    /// Number of broadcasts issued so far
    pub async fn issued(&self) -> u64 {
        *self.sequence.lock().await
    }
}
