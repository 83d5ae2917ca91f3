//! Server → Client messages (dashboard protocol)

use serde::{Deserialize, Serialize};

use crate::types::*;

/// Messages sent from the daemon to dashboard clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Full state sync
    Sessions {
        sessions: Vec<SessionMeta>,
    },
    Events {
        session_id: String,
        events: Vec<MonitorEvent>,
    },
    AllEvents {
        events: Vec<MonitorEvent>,
    },
    EventDetail {
        session_id: String,
        event: Option<MonitorEvent>,
    },

    // Incremental updates
    Event {
        event: MonitorEvent,
    },
    SessionUpdate {
        session: SessionMeta,
    },
    /// Bulk change (hide-all / delete-all); clients should refetch the list.
    SessionsUpdated,

    // Wrapper streaming
    WrappersList {
        wrappers: Vec<WrapperSummary>,
    },
    WrapperConnected {
        wrapper: WrapperSummary,
    },
    WrapperDisconnected {
        wrapper_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    WrapperState {
        wrapper_id: String,
        state: WrapperState,
    },
    WrapperOutput {
        wrapper_id: String,
        data: String,
    },

    // Errors
    Error {
        message: String,
    },
}
