//! Transport layer for line-oriented TCP connections
//!
//! This module provides:
//! - Connection handles shared by the registry, broadcaster and sessions
//! - Per-connection outbound queues drained by a timed writer task

pub mod connection;

// Re-export commonly used types
pub use connection::{
    AcceptedConnection, ConnectionHandle, ConnectionId, TransportConfig, spawn_connection,
};
