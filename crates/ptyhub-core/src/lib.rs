//! ptyhub-core: Shared protocol library for ptyhub.
//!
//! Provides the JSON control frames multiplexed with raw terminal bytes on
//! an attach connection, terminal-size clamping, close codes and the error
//! taxonomy shared by server and clients.

pub mod error;
pub mod frames;

// Re-export commonly used items at crate root.
pub use error::{HubError, HubResult};
pub use frames::{
    clamp_idle_threshold, clamp_size, decode_client_text, ClientFrame, ClientText, ServerFrame,
    CLOSE_GOING_AWAY, CLOSE_NORMAL, CLOSE_SESSION_NOT_FOUND,
};
