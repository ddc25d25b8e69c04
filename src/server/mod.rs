//! Line relay server
//!
//! ## Components
//!
//! - **Registry**: joined connections and their nicknames
//! - **Broadcaster**: ordered fan-out of one line to every registered connection
//! - **Session**: per-connection loop interpreting `/join`, `/exit` and chat lines
//! - **Listener**: accept loop spawning one session per connection

pub mod broadcast;
pub mod listener;
pub mod registry;
pub mod session;
pub mod state;

pub use broadcast::{BroadcastReport, Broadcaster};
pub use listener::ChatServer;
pub use registry::{Registry, RegistryEntry};
pub use session::Session;
pub use state::{ServerState, ServerStats};
