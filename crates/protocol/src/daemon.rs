//! Daemon control-channel messages.
//!
//! Newline-delimited JSON over the daemon's control socket. Used by the CLI
//! to spawn or attach wrapper sessions and by wrapper hosts to stream output
//! and report state back to the daemon.

use serde::{Deserialize, Serialize};

use crate::types::{TerminalSize, WrapperState, WrapperSummary};

/// Messages sent to the daemon over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonRequest {
    /// Spawn a new wrapper pseudo-terminal.
    SpawnWrapper {
        #[serde(default)]
        args: Vec<String>,
        cwd: String,
        #[serde(default)]
        size: TerminalSize,
        /// Non-interactive prompt argument; its presence means the wrapper
        /// starts out processing instead of waiting for input.
        #[serde(skip_serializing_if = "Option::is_none")]
        prompt: Option<String>,
    },
    /// Attach an externally started wrapper process.
    WrapperRegister {
        wrapper_id: String,
        pid: u32,
        cwd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        tty: Option<String>,
    },
    GetWrappers,
    KillWrapper {
        wrapper_id: String,
    },
    InjectInput {
        wrapper_id: String,
        input: String,
    },
    /// Explicit state report from a wrapper host or hook script.
    StateUpdate {
        wrapper_id: String,
        state: WrapperState,
        #[serde(skip_serializing_if = "Option::is_none")]
        claude_session_id: Option<String>,
    },
    ResizeWrapper {
        wrapper_id: String,
        cols: u16,
        rows: u16,
    },
    Ping,
}

/// Messages sent by the daemon over the control socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonEvent {
    WrapperSpawned {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        wrapper_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    WrappersList {
        wrappers: Vec<WrapperSummary>,
    },
    WrapperStarted {
        wrapper: WrapperSummary,
    },
    WrapperEnded {
        wrapper_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
    },
    StateChanged {
        wrapper_id: String,
        state: WrapperState,
    },
    Output {
        wrapper_id: String,
        data: String,
    },
    Pong,
    Error {
        message: String,
    },
}
