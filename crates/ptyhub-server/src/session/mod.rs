//! Session management: PTY lifecycle, ring buffer, replay, idle detection.

pub mod idle;
pub mod manager;
pub mod output;
pub mod pty;
pub mod ring_buffer;
pub mod shell;
pub mod subscriber;

pub use manager::{generate_session_id, SessionConfig, SessionInfo, SessionManager};
pub use output::ReplayLimits;
pub use subscriber::{ConnectionHandle, Outbound};
