//! Line-oriented TCP chat relay with an append-only transcript
//!
//! Clients connect over plain TCP, pick a nickname with `/join <nickname>`,
//! and every line they send afterwards is rebroadcast to all joined
//! connections with a leading `HH:MM` stamp. Join, leave and chat lines are
//! also appended to a transcript file.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transcript;
pub mod transport;

pub use client::{ChatClient, ClientConfig};
pub use error::{ChatError, Result};
pub use server::{ChatServer, Registry, ServerState, ServerStats};
pub use transcript::Transcript;
pub use transport::TransportConfig;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Port the relay listens on by default
pub const DEFAULT_PORT: u16 = 3335;

/// Server configuration
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Server listen address
    pub bind_addr: SocketAddr,
    /// Transcript file, created if missing and only ever appended to
    pub transcript_path: PathBuf,
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Longest accepted input line in bytes
    pub max_line_length: usize,
    /// Outbound queue and write timeout per connection
    pub transport: TransportConfig,
    /// How often to log connection counts; `None` disables the report
    pub stats_interval: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            transcript_path: PathBuf::from(transcript::DEFAULT_TRANSCRIPT_PATH),
            max_connections: 10000,
            max_line_length: 8192,
            transport: TransportConfig::default(),
            stats_interval: Some(Duration::from_secs(5)),
        }
    }
}

impl ServerConfig {
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    pub fn with_transcript_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.transcript_path = path.into();
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_max_line_length(mut self, max: usize) -> Self {
        self.max_line_length = max;
        self
    }

    pub fn with_transport(mut self, transport: TransportConfig) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_stats_interval(mut self, interval: Option<Duration>) -> Self {
        self.stats_interval = interval;
        self
    }
}
