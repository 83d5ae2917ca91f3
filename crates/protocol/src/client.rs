//! Client → Server messages (dashboard protocol)

use serde::{Deserialize, Serialize};

/// Subscription scope requested by a dashboard connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", untagged)]
pub enum SubscriptionScope {
    /// Subscribe to a single session's events.
    Session { session_id: String },
    /// Subscribe to everything ("all").
    All(AllScope),
}

/// Marker for the literal string `"all"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllScope {
    All,
}

/// Messages sent from a dashboard client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Subscriptions
    Subscribe {
        scope: SubscriptionScope,
    },

    // Hydration / history
    GetSessions {
        #[serde(default)]
        include_hidden: bool,
    },
    GetEvents {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    GetAllRecentEvents {
        #[serde(skip_serializing_if = "Option::is_none")]
        limit: Option<usize>,
    },
    GetEventDetail {
        session_id: String,
        event_id: String,
    },

    // Session administration
    HideSession {
        session_id: String,
    },
    UnhideSession {
        session_id: String,
    },
    DeleteSession {
        session_id: String,
    },
    HideAllSessions,
    DeleteAllSessions,
    SetParent {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        parent_session_id: Option<String>,
    },
    TogglePin {
        session_id: String,
    },
    SetUserInitiated {
        session_id: String,
        is_user_initiated: bool,
    },
    RenameSession {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },

    // Wrapper interaction
    GetWrappers,
    InjectInput {
        wrapper_id: String,
        input: String,
    },
    ResizeWrapper {
        wrapper_id: String,
        cols: u16,
        rows: u16,
    },
}
