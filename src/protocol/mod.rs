//! Protocol layer for the line relay
//!
//! This module provides:
//! - Client command parsing (`/join`, `/exit`, chat text)
//! - Broadcast line formatting for notices and chat messages

pub mod messages;

// Re-export commonly used types
pub use messages::{
    Broadcast, ChatEvent, Command, EXIT_COMMAND, JOIN_COMMAND, JOIN_PROMPT, clock_stamp,
};
