//! Core types shared across the protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Hook lifecycle point that produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HookType {
    SessionStart,
    SessionEnd,
    PreToolUse,
    PostToolUse,
    Notification,
    Stop,
    SubagentStart,
    SubagentStop,
    UserPromptSubmit,
    PreCompact,
    /// Hook runtimes grow new event names over time; tolerate them on the wire.
    #[serde(other)]
    Other,
}

/// Normalized event category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    ToolCall,
    ToolResult,
    Message,
    Notification,
    Thinking,
    Error,
    AgentSpawn,
    AgentComplete,
    #[serde(other)]
    Other,
}

/// One observation from a hook script. Immutable once ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorEvent {
    #[serde(default)]
    pub id: String,
    pub session_id: String,
    pub machine_id: String,
    pub working_directory: String,
    /// Unix milliseconds.
    pub timestamp: u64,
    pub hook_type: HookType,
    pub event_type: EventKind,
    #[serde(default)]
    pub data: Value,
    /// Set by the broker when an event is re-routed to a virtual session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
}

impl MonitorEvent {
    /// Tool name, when the payload carries one.
    pub fn tool_name(&self) -> Option<&str> {
        self.data.get("tool_name").and_then(Value::as_str)
    }

    /// Whether the payload carries an error detail.
    pub fn has_error(&self) -> bool {
        matches!(self.event_type, EventKind::Error)
            || self
                .data
                .get("error")
                .map(|e| !e.is_null())
                .unwrap_or(false)
    }
}

/// Session status as tracked by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Error,
}

/// Running token-usage totals for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_creation
    }
}

/// The broker's view of one logical session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMeta {
    pub session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<String>,
    /// Explicit user override; takes precedence over the inferred parent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manual_parent_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub child_session_ids: Vec<String>,
    pub status: SessionStatus,
    pub start_time: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    pub is_user_initiated: bool,
    pub is_pinned: bool,
    pub hidden: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub working_directory: String,
    pub machine_id: String,
    pub last_event_at: u64,
}

impl SessionMeta {
    /// Effective parent: manual override wins over the inferred link.
    pub fn effective_parent(&self) -> Option<&str> {
        self.manual_parent_session_id
            .as_deref()
            .or(self.parent_session_id.as_deref())
    }
}

/// Wrapper pseudo-terminal lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WrapperState {
    Starting,
    Processing,
    WaitingInput,
    Ended,
}

/// Summary of one supervised wrapper process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WrapperSummary {
    pub wrapper_id: String,
    pub pid: u32,
    pub cwd: String,
    pub state: WrapperState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claude_session_id: Option<String>,
    pub started_at: u64,
}

/// Requested terminal dimensions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 120, rows: 30 }
    }
}
