//! Skydeck Protocol
//!
//! Shared types for communication between the Skydeck daemon and its clients:
//! hook-event ingress records, the daemon control channel, and the dashboard
//! WebSocket protocol. Everything is serialized as newline-delimited JSON or
//! JSON WebSocket frames.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod daemon;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use daemon::{DaemonEvent, DaemonRequest};
pub use server::ServerMessage;
pub use types::*;

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Generate a short hex ID for virtual (synthesized) sessions.
pub fn new_virtual_id() -> String {
    let full = Uuid::new_v4().simple().to_string();
    format!("virt-{}", &full[..8])
}
