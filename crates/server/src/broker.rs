//! Event broker — turns the flat hook-event stream into a session hierarchy.
//!
//! The broker runs as a single actor task that owns the session map, the
//! per-session sub-agent stacks, and the cross-process spawn candidates.
//! Callers talk to it through a [`BrokerHandle`]; every mutation persists
//! through the injected persistence channel before a notification is
//! broadcast, so a crash between the two only risks a missed broadcast,
//! never an inconsistent store. Correlation for one event always runs to
//! completion before the next is processed.

use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use skydeck_protocol::{
    EventKind, HookType, MonitorEvent, SessionMeta, SessionStatus, TokenUsage,
};

use crate::correlation::{PendingSpawn, SpawnCandidates, SubagentStacks};
use crate::persistence::PersistCommand;

/// The tool whose invocation spawns a sub-agent.
const TASK_TOOL: &str = "Task";

const COMMAND_BUFFER: usize = 1024;
const NOTIFY_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
}

/// Notifications fanned out to the broadcast server.
#[derive(Debug, Clone)]
pub enum BrokerNotification {
    SessionCreated { session: SessionMeta },
    SessionUpdated { session: SessionMeta },
    /// Bulk change (hide-all / delete-all / delete); clients refetch the list.
    SessionsChanged,
    Event { event: MonitorEvent },
}

/// Administrative operations, all validated against "session must exist".
#[derive(Debug)]
pub enum AdminOp {
    Hide { session_id: String, hidden: bool },
    Delete { session_id: String },
    HideAll,
    DeleteAll,
    SetParent {
        session_id: String,
        parent_session_id: Option<String>,
    },
    TogglePin { session_id: String },
    SetUserInitiated { session_id: String, value: bool },
    Rename {
        session_id: String,
        label: Option<String>,
    },
}

enum BrokerCommand {
    Ingest(Box<MonitorEvent>),
    GetSessions {
        include_hidden: bool,
        reply: oneshot::Sender<Vec<SessionMeta>>,
    },
    Admin {
        op: AdminOp,
        reply: oneshot::Sender<Result<(), BrokerError>>,
    },
}

/// Handle to the running broker actor (cheap to clone).
#[derive(Clone)]
pub struct BrokerHandle {
    command_tx: mpsc::Sender<BrokerCommand>,
    notify_tx: broadcast::Sender<BrokerNotification>,
}

impl BrokerHandle {
    /// Feed one ingress event into the broker.
    pub async fn ingest(&self, event: MonitorEvent) {
        if self
            .command_tx
            .send(BrokerCommand::Ingest(Box::new(event)))
            .await
            .is_err()
        {
            warn!(component = "broker", "Broker channel closed, event dropped");
        }
    }

    /// Current session list.
    pub async fn sessions(&self, include_hidden: bool) -> Vec<SessionMeta> {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .command_tx
            .send(BrokerCommand::GetSessions {
                include_hidden,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return Vec::new();
        }
        reply_rx.await.unwrap_or_default()
    }

    /// Run one administrative operation.
    pub async fn admin(&self, op: AdminOp) -> Result<(), BrokerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let described = format!("{:?}", op);
        if self
            .command_tx
            .send(BrokerCommand::Admin { op, reply: reply_tx })
            .await
            .is_err()
        {
            warn!(component = "broker", op = %described, "Broker channel closed");
            return Ok(());
        }
        reply_rx.await.unwrap_or(Ok(()))
    }

    /// Subscribe to broker notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerNotification> {
        self.notify_tx.subscribe()
    }
}

/// The broker actor. Owns all session state exclusively.
pub struct Broker {
    sessions: HashMap<String, SessionMeta>,
    stacks: SubagentStacks,
    spawns: SpawnCandidates,
    persist_tx: mpsc::Sender<PersistCommand>,
    notify_tx: broadcast::Sender<BrokerNotification>,
}

impl Broker {
    /// Spawn the broker task, seeded with sessions restored from the store.
    pub fn spawn(
        persist_tx: mpsc::Sender<PersistCommand>,
        restored: Vec<SessionMeta>,
    ) -> BrokerHandle {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (notify_tx, _) = broadcast::channel(NOTIFY_BUFFER);

        let mut sessions = HashMap::new();
        for session in restored {
            sessions.insert(session.session_id.clone(), session);
        }
        if !sessions.is_empty() {
            info!(
                component = "broker",
                count = sessions.len(),
                "Restored sessions from store"
            );
        }

        let broker = Broker {
            sessions,
            stacks: SubagentStacks::new(),
            spawns: SpawnCandidates::new(),
            persist_tx,
            notify_tx: notify_tx.clone(),
        };

        tokio::spawn(broker.run(command_rx));

        BrokerHandle {
            command_tx,
            notify_tx,
        }
    }

    async fn run(mut self, mut command_rx: mpsc::Receiver<BrokerCommand>) {
        while let Some(cmd) = command_rx.recv().await {
            match cmd {
                BrokerCommand::Ingest(event) => self.handle_event(*event).await,
                BrokerCommand::GetSessions {
                    include_hidden,
                    reply,
                } => {
                    let mut sessions: Vec<SessionMeta> = self
                        .sessions
                        .values()
                        .filter(|s| include_hidden || !s.hidden)
                        .cloned()
                        .collect();
                    sessions.sort_by_key(|s| s.start_time);
                    let _ = reply.send(sessions);
                }
                BrokerCommand::Admin { op, reply } => {
                    let result = self.handle_admin(op).await;
                    let _ = reply.send(result);
                }
            }
        }
        debug!(component = "broker", "Broker stopped");
    }

    // -- Event ingestion ---------------------------------------------------

    async fn handle_event(&mut self, mut event: MonitorEvent) {
        if event.id.is_empty() {
            event.id = skydeck_protocol::new_id();
        }

        self.spawns.collect_expired(event.timestamp);

        let original_session_id = event.session_id.clone();
        let is_task_call = event.hook_type == HookType::PreToolUse
            && event.tool_name() == Some(TASK_TOOL);
        let is_task_completion = event.hook_type == HookType::PostToolUse
            && event.tool_name() == Some(TASK_TOOL);
        let mut stopped_subagent = None;

        if is_task_call {
            let agent_type = task_agent_type(&event.data);
            let ctx = self
                .stacks
                .push(&original_session_id, agent_type.clone(), event.timestamp);
            info!(
                component = "broker",
                session_id = %original_session_id,
                virtual_id = %ctx.virtual_session_id,
                agent_type = agent_type.as_deref().unwrap_or("unknown"),
                "Sub-agent spawn tracked"
            );
            // Feed the cross-process correlation path too; a sub-agent may
            // show up as an entirely separate connection.
            self.spawns.record(PendingSpawn {
                parent_session_id: original_session_id.clone(),
                working_directory: event.working_directory.clone(),
                timestamp: event.timestamp,
                agent_type,
            });
        } else if event.hook_type == HookType::SubagentStop {
            // LIFO: the most recently started sub-agent is the one stopping.
            match self.stacks.pop(&original_session_id) {
                Some(ctx) => {
                    debug!(
                        component = "broker",
                        session_id = %original_session_id,
                        virtual_id = %ctx.virtual_session_id,
                        "Sub-agent completed"
                    );
                    // The stop belongs to the virtual session it closes.
                    event.parent_session_id = Some(original_session_id.clone());
                    event.session_id = ctx.virtual_session_id.clone();
                    stopped_subagent = Some(ctx);
                }
                None => {
                    debug!(
                        component = "broker",
                        session_id = %original_session_id,
                        "SubagentStop with no active sub-agent context"
                    );
                }
            }
        } else if !is_task_completion {
            // Re-route to the active sub-agent, if any. The spawning tool's
            // own completion stays attributed to the parent.
            if let Some(top) = self.stacks.top(&original_session_id) {
                event.parent_session_id = Some(original_session_id.clone());
                event.session_id = top.virtual_session_id.clone();
            }
        }

        let created_with_parent = self.resolve_session(&event);

        // A stop closes its virtual session regardless of how the emitting
        // hook labelled the event.
        if let Some(ctx) = stopped_subagent {
            if let Some(meta) = self.sessions.get_mut(&event.session_id) {
                if meta.agent_type.is_none() {
                    meta.agent_type = ctx.agent_type;
                }
                meta.status = SessionStatus::Completed;
                meta.end_time = Some(event.timestamp);
            }
        }

        let snapshot = self.apply_event(&event);

        // One session notification per event: created for a session this
        // event materialized, updated otherwise.
        if let Some(snapshot) = snapshot {
            self.persist_session(&snapshot).await;
            match created_with_parent {
                Some(_) => {
                    self.notify(BrokerNotification::SessionCreated { session: snapshot })
                }
                None => self.notify(BrokerNotification::SessionUpdated { session: snapshot }),
            }
        }

        // Linking mutates the parent too; persist and announce that
        // separately from the child's creation.
        if let Some(Some(parent_id)) = created_with_parent {
            self.attach_child(&parent_id, &event.session_id).await;
        }

        let _ = self
            .persist_tx
            .send(PersistCommand::SaveEvent(Box::new(event.clone())))
            .await;
        self.notify(BrokerNotification::Event { event });
    }

    /// Resolve or create the `SessionMeta` for the (possibly rewritten)
    /// session id, including parent resolution for new sessions.
    ///
    /// Returns `None` when the session already existed, and otherwise
    /// `Some(resolved_parent)` for the session created here.
    fn resolve_session(&mut self, event: &MonitorEvent) -> Option<Option<String>> {
        if self.sessions.contains_key(&event.session_id) {
            return None;
        }

        // (a) explicit parent on the event, (b) active virtual id, (c) fuzzy
        // spawn-candidate match. First hit wins.
        let mut agent_type = None;
        let parent_session_id = if let Some(parent) = event.parent_session_id.clone() {
            agent_type = self
                .stacks
                .find_virtual(&event.session_id)
                .and_then(|ctx| ctx.agent_type.clone());
            Some(parent)
        } else if let Some(ctx) = self.stacks.find_virtual(&event.session_id) {
            agent_type = ctx.agent_type.clone();
            Some(ctx.parent_session_id.clone())
        } else if let Some(spawn) = self.spawns.consume(
            &event.session_id,
            &event.working_directory,
            event.timestamp,
        ) {
            info!(
                component = "broker",
                session_id = %event.session_id,
                parent_id = %spawn.parent_session_id,
                "Correlated new session to spawn candidate"
            );
            agent_type = spawn.agent_type.clone();
            Some(spawn.parent_session_id)
        } else {
            None
        };

        let is_user_initiated = parent_session_id.is_none();
        let meta = SessionMeta {
            session_id: event.session_id.clone(),
            parent_session_id: parent_session_id.clone(),
            manual_parent_session_id: None,
            agent_type,
            child_session_ids: Vec::new(),
            status: SessionStatus::Active,
            start_time: event.timestamp,
            end_time: None,
            token_usage: TokenUsage::default(),
            is_user_initiated,
            // Primary sessions surface at the top of the dashboard.
            is_pinned: is_user_initiated,
            hidden: false,
            label: None,
            working_directory: event.working_directory.clone(),
            machine_id: event.machine_id.clone(),
            last_event_at: event.timestamp,
        };
        self.sessions.insert(meta.session_id.clone(), meta);
        Some(parent_session_id)
    }

    /// Apply `event_type`-specific state transitions and counters.
    /// Returns a snapshot for the caller to persist and announce.
    fn apply_event(&mut self, event: &MonitorEvent) -> Option<SessionMeta> {
        let meta = self.sessions.get_mut(&event.session_id)?;

        meta.last_event_at = event.timestamp;

        match event.event_type {
            EventKind::SessionStart => {
                meta.status = SessionStatus::Active;
            }
            EventKind::SessionEnd | EventKind::AgentComplete => {
                meta.status = SessionStatus::Completed;
                meta.end_time = Some(event.timestamp);
            }
            _ => {}
        }
        if event.has_error() {
            meta.status = SessionStatus::Error;
        }

        if let Some(delta) = token_delta(&event.data) {
            meta.token_usage.input += delta.input;
            meta.token_usage.output += delta.output;
            meta.token_usage.cache_read += delta.cache_read;
            meta.token_usage.cache_creation += delta.cache_creation;
        }

        Some(meta.clone())
    }

    async fn attach_child(&mut self, parent_id: &str, child_id: &str) {
        let Some(parent) = self.sessions.get_mut(parent_id) else {
            debug!(
                component = "broker",
                parent_id, child_id, "Resolved parent is not tracked; link kept on child only"
            );
            return;
        };
        if !parent.child_session_ids.iter().any(|c| c == child_id) {
            parent.child_session_ids.push(child_id.to_string());
        }
        let snapshot = parent.clone();
        self.persist_session(&snapshot).await;
        self.notify(BrokerNotification::SessionUpdated { session: snapshot });
    }

    async fn detach_child(&mut self, parent_id: &str, child_id: &str) {
        let Some(parent) = self.sessions.get_mut(parent_id) else {
            return;
        };
        parent.child_session_ids.retain(|c| c != child_id);
        let snapshot = parent.clone();
        self.persist_session(&snapshot).await;
        self.notify(BrokerNotification::SessionUpdated { session: snapshot });
    }

    // -- Administration ----------------------------------------------------

    async fn handle_admin(&mut self, op: AdminOp) -> Result<(), BrokerError> {
        match op {
            AdminOp::Hide { session_id, hidden } => {
                let meta = self.session_mut(&session_id)?;
                meta.hidden = hidden;
                let snapshot = meta.clone();
                self.persist_session(&snapshot).await;
                self.notify(BrokerNotification::SessionUpdated { session: snapshot });
                Ok(())
            }

            AdminOp::Delete { session_id } => {
                let removed = self
                    .sessions
                    .remove(&session_id)
                    .ok_or_else(|| BrokerError::SessionNotFound(session_id.clone()))?;

                if let Some(parent_id) = removed.effective_parent().map(str::to_string) {
                    self.detach_child(&parent_id, &session_id).await;
                }

                // Children of a deleted session become parentless primaries;
                // the child list and the children's back-links must never
                // disagree.
                for child_id in removed.child_session_ids.clone() {
                    if let Some(child) = self.sessions.get_mut(&child_id) {
                        child.parent_session_id = None;
                        if child.manual_parent_session_id.as_deref() == Some(session_id.as_str()) {
                            child.manual_parent_session_id = None;
                        }
                        child.is_user_initiated = child.effective_parent().is_none();
                        let snapshot = child.clone();
                        self.persist_session(&snapshot).await;
                        self.notify(BrokerNotification::SessionUpdated { session: snapshot });
                    }
                }

                self.stacks.remove(&session_id);
                let _ = self
                    .persist_tx
                    .send(PersistCommand::DeleteSession {
                        session_id: session_id.clone(),
                    })
                    .await;
                self.notify(BrokerNotification::SessionsChanged);
                Ok(())
            }

            AdminOp::HideAll => {
                let ids: Vec<String> = self.sessions.keys().cloned().collect();
                for id in ids {
                    if let Some(meta) = self.sessions.get_mut(&id) {
                        meta.hidden = true;
                        let snapshot = meta.clone();
                        self.persist_session(&snapshot).await;
                    }
                }
                self.notify(BrokerNotification::SessionsChanged);
                Ok(())
            }

            AdminOp::DeleteAll => {
                self.sessions.clear();
                self.stacks.clear();
                self.spawns.clear();
                let _ = self.persist_tx.send(PersistCommand::DeleteAllSessions).await;
                self.notify(BrokerNotification::SessionsChanged);
                Ok(())
            }

            AdminOp::SetParent {
                session_id,
                parent_session_id,
            } => {
                if !self.sessions.contains_key(&session_id) {
                    return Err(BrokerError::SessionNotFound(session_id));
                }
                if let Some(ref parent_id) = parent_session_id {
                    if !self.sessions.contains_key(parent_id) {
                        return Err(BrokerError::SessionNotFound(parent_id.clone()));
                    }
                }

                let old_parent = self
                    .sessions
                    .get(&session_id)
                    .and_then(|m| m.effective_parent().map(str::to_string));
                if let Some(old_parent_id) = old_parent {
                    self.detach_child(&old_parent_id, &session_id).await;
                }

                {
                    let meta = self.session_mut(&session_id)?;
                    meta.manual_parent_session_id = parent_session_id.clone();
                    if parent_session_id.is_none() {
                        meta.parent_session_id = None;
                    }
                    meta.is_user_initiated = meta.effective_parent().is_none();
                    let snapshot = meta.clone();
                    self.persist_session(&snapshot).await;
                    self.notify(BrokerNotification::SessionUpdated { session: snapshot });
                }

                if let Some(parent_id) = parent_session_id {
                    self.attach_child(&parent_id, &session_id).await;
                }
                Ok(())
            }

            AdminOp::TogglePin { session_id } => {
                let meta = self.session_mut(&session_id)?;
                meta.is_pinned = !meta.is_pinned;
                let snapshot = meta.clone();
                self.persist_session(&snapshot).await;
                self.notify(BrokerNotification::SessionUpdated { session: snapshot });
                Ok(())
            }

            AdminOp::SetUserInitiated { session_id, value } => {
                let meta = self.session_mut(&session_id)?;
                meta.is_user_initiated = value;
                let snapshot = meta.clone();
                self.persist_session(&snapshot).await;
                self.notify(BrokerNotification::SessionUpdated { session: snapshot });
                Ok(())
            }

            AdminOp::Rename { session_id, label } => {
                let meta = self.session_mut(&session_id)?;
                meta.label = label.filter(|l| !l.trim().is_empty());
                let snapshot = meta.clone();
                self.persist_session(&snapshot).await;
                self.notify(BrokerNotification::SessionUpdated { session: snapshot });
                Ok(())
            }
        }
    }

    fn session_mut(&mut self, session_id: &str) -> Result<&mut SessionMeta, BrokerError> {
        self.sessions
            .get_mut(session_id)
            .ok_or_else(|| BrokerError::SessionNotFound(session_id.to_string()))
    }

    async fn persist_session(&self, session: &SessionMeta) {
        if self
            .persist_tx
            .send(PersistCommand::SaveSession(Box::new(session.clone())))
            .await
            .is_err()
        {
            warn!(
                component = "broker",
                session_id = %session.session_id,
                "Persistence channel closed; in-memory state remains authoritative"
            );
        }
    }

    fn notify(&self, notification: BrokerNotification) {
        // No subscribers is fine (e.g. before the first dashboard connects).
        let _ = self.notify_tx.send(notification);
    }
}

fn task_agent_type(data: &Value) -> Option<String> {
    data.get("tool_input")
        .and_then(|input| input.get("subagent_type"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Token counters appear either nested under `usage` or at the payload top
/// level depending on the emitting hook.
fn token_delta(data: &Value) -> Option<TokenUsage> {
    let source = data.get("usage").unwrap_or(data);
    let read = |key: &str| source.get(key).and_then(Value::as_u64).unwrap_or(0);

    let delta = TokenUsage {
        input: read("input_tokens"),
        output: read("output_tokens"),
        cache_read: read("cache_read_input_tokens"),
        cache_creation: read("cache_creation_input_tokens"),
    };
    (delta.total() > 0).then_some(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(session_id: &str, hook: HookType, kind: EventKind, ts: u64) -> MonitorEvent {
        MonitorEvent {
            id: String::new(),
            session_id: session_id.to_string(),
            machine_id: "mac-1".to_string(),
            working_directory: "/repo".to_string(),
            timestamp: ts,
            hook_type: hook,
            event_type: kind,
            data: Value::Null,
            parent_session_id: None,
        }
    }

    fn task_spawn(session_id: &str, agent: &str, ts: u64) -> MonitorEvent {
        let mut e = event(session_id, HookType::PreToolUse, EventKind::ToolCall, ts);
        e.data = json!({"tool_name": "Task", "tool_input": {"subagent_type": agent}});
        e
    }

    fn tool_call(session_id: &str, tool: &str, ts: u64) -> MonitorEvent {
        let mut e = event(session_id, HookType::PreToolUse, EventKind::ToolCall, ts);
        e.data = json!({"tool_name": tool});
        e
    }

    fn spawn_broker() -> (BrokerHandle, mpsc::Receiver<PersistCommand>) {
        let (persist_tx, persist_rx) = mpsc::channel(1024);
        let handle = Broker::spawn(persist_tx, Vec::new());
        (handle, persist_rx)
    }

    async fn find_virtual_session(handle: &BrokerHandle, parent: &str) -> SessionMeta {
        handle
            .sessions(true)
            .await
            .into_iter()
            .find(|s| s.session_id != parent)
            .expect("virtual session exists")
    }

    #[tokio::test]
    async fn task_events_are_rerouted_to_virtual_session() {
        let (handle, _persist_rx) = spawn_broker();
        let mut notifications = handle.subscribe();

        handle.ingest(task_spawn("S1", "reviewer", 1_000)).await;
        handle.ingest(tool_call("S1", "Read", 1_100)).await;
        handle
            .ingest(event("S1", HookType::SubagentStop, EventKind::AgentComplete, 1_200))
            .await;

        let sessions = handle.sessions(true).await;
        assert_eq!(sessions.len(), 2);

        let virt = find_virtual_session(&handle, "S1").await;
        assert_eq!(virt.parent_session_id.as_deref(), Some("S1"));
        assert_eq!(virt.agent_type.as_deref(), Some("reviewer"));
        assert_eq!(virt.status, SessionStatus::Completed);
        assert_eq!(virt.end_time, Some(1_200));
        assert!(!virt.is_user_initiated);

        let parent = sessions
            .iter()
            .find(|s| s.session_id == "S1")
            .expect("parent");
        assert_eq!(parent.child_session_ids, vec![virt.session_id.clone()]);
        assert!(parent.is_user_initiated);
        assert!(parent.is_pinned);

        // The Read event itself was attributed to the virtual session.
        let mut read_event = None;
        while let Ok(n) = notifications.try_recv() {
            if let BrokerNotification::Event { event } = n {
                if event.tool_name() == Some("Read") {
                    read_event = Some(event);
                }
            }
        }
        let read_event = read_event.expect("read event notification");
        assert_eq!(read_event.session_id, virt.session_id);
        assert_eq!(read_event.parent_session_id.as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn nested_spawns_complete_lifo() {
        let (handle, _persist_rx) = spawn_broker();

        handle.ingest(task_spawn("S1", "outer", 1_000)).await;
        handle.ingest(task_spawn("S1", "inner", 1_050)).await;
        // Creates the inner virtual session (stack top).
        handle.ingest(tool_call("S1", "Read", 1_100)).await;

        // First stop completes the inner agent, never the outer.
        handle
            .ingest(event("S1", HookType::SubagentStop, EventKind::AgentComplete, 1_200))
            .await;

        let inner = handle
            .sessions(true)
            .await
            .into_iter()
            .find(|s| s.agent_type.as_deref() == Some("inner"))
            .expect("inner virtual session");
        assert_eq!(inner.status, SessionStatus::Completed);
        assert_eq!(inner.end_time, Some(1_200));

        // Outer context is now the stack top; a new event creates its meta.
        handle.ingest(tool_call("S1", "Grep", 1_300)).await;
        handle
            .ingest(event("S1", HookType::SubagentStop, EventKind::AgentComplete, 1_400))
            .await;

        let outer = handle
            .sessions(true)
            .await
            .into_iter()
            .find(|s| s.agent_type.as_deref() == Some("outer"))
            .expect("outer virtual session");
        assert_eq!(outer.status, SessionStatus::Completed);
        assert_eq!(outer.end_time, Some(1_400));

        // After both stops, events attribute to S1 again.
        let mut notifications = handle.subscribe();
        handle.ingest(tool_call("S1", "Edit", 1_500)).await;
        handle.sessions(true).await; // barrier
        let mut edit_session = None;
        while let Ok(n) = notifications.try_recv() {
            if let BrokerNotification::Event { event } = n {
                if event.tool_name() == Some("Edit") {
                    edit_session = Some(event.session_id);
                }
            }
        }
        assert_eq!(edit_session.as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn task_completion_stays_on_parent() {
        let (handle, _persist_rx) = spawn_broker();
        let mut notifications = handle.subscribe();

        handle.ingest(task_spawn("S1", "reviewer", 1_000)).await;
        let mut completion = event("S1", HookType::PostToolUse, EventKind::ToolResult, 1_100);
        completion.data = json!({"tool_name": "Task"});
        handle.ingest(completion).await;
        handle.sessions(true).await; // barrier

        let mut task_result_session = None;
        while let Ok(n) = notifications.try_recv() {
            if let BrokerNotification::Event { event } = n {
                if event.hook_type == HookType::PostToolUse {
                    task_result_session = Some(event.session_id);
                }
            }
        }
        assert_eq!(task_result_session.as_deref(), Some("S1"));
    }

    #[tokio::test]
    async fn cross_process_child_links_by_directory_and_window() {
        let (handle, _persist_rx) = spawn_broker();

        // S2 spawns at t=0 in /repo.
        handle.ingest(task_spawn("S2", "worker", 0)).await;

        // A separate connection: S3's first event at t=5000 in /repo/sub.
        let mut first = event("S3", HookType::SessionStart, EventKind::SessionStart, 5_000);
        first.working_directory = "/repo/sub".to_string();
        handle.ingest(first).await;

        let sessions = handle.sessions(true).await;
        let s3 = sessions
            .iter()
            .find(|s| s.session_id == "S3")
            .expect("S3 tracked");
        assert_eq!(s3.parent_session_id.as_deref(), Some("S2"));
        assert_eq!(s3.agent_type.as_deref(), Some("worker"));
        assert!(!s3.is_user_initiated);

        let s2 = sessions
            .iter()
            .find(|s| s.session_id == "S2")
            .expect("S2 tracked");
        assert!(s2.child_session_ids.contains(&"S3".to_string()));
    }

    #[tokio::test]
    async fn expired_spawn_candidate_does_not_correlate() {
        let (handle, _persist_rx) = spawn_broker();

        handle.ingest(task_spawn("S2", "worker", 0)).await;

        let mut late = event("S4", HookType::SessionStart, EventKind::SessionStart, 120_000);
        late.working_directory = "/repo".to_string();
        handle.ingest(late).await;

        let sessions = handle.sessions(true).await;
        let s4 = sessions
            .iter()
            .find(|s| s.session_id == "S4")
            .expect("S4 tracked");
        assert!(s4.parent_session_id.is_none());
        assert!(s4.is_user_initiated);
    }

    #[tokio::test]
    async fn session_lifecycle_transitions() {
        let (handle, _persist_rx) = spawn_broker();

        handle
            .ingest(event("S1", HookType::SessionStart, EventKind::SessionStart, 100))
            .await;
        let sessions = handle.sessions(true).await;
        assert_eq!(sessions[0].status, SessionStatus::Active);

        let mut err_event = event("S1", HookType::PostToolUse, EventKind::ToolResult, 200);
        err_event.data = json!({"tool_name": "Bash", "error": "exit 1"});
        handle.ingest(err_event).await;
        let sessions = handle.sessions(true).await;
        assert_eq!(sessions[0].status, SessionStatus::Error);

        handle
            .ingest(event("S1", HookType::SessionEnd, EventKind::SessionEnd, 300))
            .await;
        let sessions = handle.sessions(true).await;
        assert_eq!(sessions[0].status, SessionStatus::Completed);
        assert_eq!(sessions[0].end_time, Some(300));
    }

    #[tokio::test]
    async fn token_usage_accumulates() {
        let (handle, _persist_rx) = spawn_broker();

        let mut first = event("S1", HookType::Stop, EventKind::Message, 100);
        first.data = json!({"usage": {"input_tokens": 100, "output_tokens": 20}});
        handle.ingest(first).await;

        let mut second = event("S1", HookType::Stop, EventKind::Message, 200);
        second.data =
            json!({"usage": {"input_tokens": 50, "cache_read_input_tokens": 400}});
        handle.ingest(second).await;

        let sessions = handle.sessions(true).await;
        let usage = sessions[0].token_usage;
        assert_eq!(usage.input, 150);
        assert_eq!(usage.output, 20);
        assert_eq!(usage.cache_read, 400);
    }

    #[tokio::test]
    async fn hide_all_then_get_sessions() {
        let (handle, _persist_rx) = spawn_broker();

        handle
            .ingest(event("S1", HookType::SessionStart, EventKind::SessionStart, 100))
            .await;
        handle
            .ingest(event("S2", HookType::SessionStart, EventKind::SessionStart, 200))
            .await;

        handle.admin(AdminOp::HideAll).await.unwrap();

        assert!(handle.sessions(false).await.is_empty());
        let all = handle.sessions(true).await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|s| s.hidden));
    }

    #[tokio::test]
    async fn delete_detaches_from_parent_and_reports_not_found_after() {
        let (handle, mut persist_rx) = spawn_broker();

        handle.ingest(task_spawn("S1", "reviewer", 1_000)).await;
        handle.ingest(tool_call("S1", "Read", 1_100)).await;
        let virt = find_virtual_session(&handle, "S1").await;

        handle
            .admin(AdminOp::Delete {
                session_id: virt.session_id.clone(),
            })
            .await
            .unwrap();

        let sessions = handle.sessions(true).await;
        assert_eq!(sessions.len(), 1);
        assert!(sessions[0].child_session_ids.is_empty());

        // The store saw the delete.
        let mut deleted = false;
        while let Ok(cmd) = persist_rx.try_recv() {
            if matches!(cmd, PersistCommand::DeleteSession { ref session_id } if *session_id == virt.session_id)
            {
                deleted = true;
            }
        }
        assert!(deleted);

        // Second delete signals not-found instead of panicking.
        let err = handle
            .admin(AdminOp::Delete {
                session_id: virt.session_id.clone(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn delete_parent_orphans_children_consistently() {
        let (handle, _persist_rx) = spawn_broker();

        handle.ingest(task_spawn("S2", "worker", 0)).await;
        let mut first = event("S3", HookType::SessionStart, EventKind::SessionStart, 1_000);
        first.working_directory = "/repo/sub".to_string();
        handle.ingest(first).await;

        handle
            .admin(AdminOp::Delete {
                session_id: "S2".to_string(),
            })
            .await
            .unwrap();

        let sessions = handle.sessions(true).await;
        assert_eq!(sessions.len(), 1);
        let s3 = &sessions[0];
        assert!(s3.parent_session_id.is_none());
        assert!(s3.is_user_initiated);
    }

    #[tokio::test]
    async fn set_parent_keeps_links_mutually_consistent() {
        let (handle, _persist_rx) = spawn_broker();

        handle
            .ingest(event("A", HookType::SessionStart, EventKind::SessionStart, 100))
            .await;
        handle
            .ingest(event("B", HookType::SessionStart, EventKind::SessionStart, 60_000))
            .await;
        handle
            .ingest(event("C", HookType::SessionStart, EventKind::SessionStart, 120_000))
            .await;

        handle
            .admin(AdminOp::SetParent {
                session_id: "C".to_string(),
                parent_session_id: Some("A".to_string()),
            })
            .await
            .unwrap();

        let sessions = handle.sessions(true).await;
        let a = sessions.iter().find(|s| s.session_id == "A").unwrap();
        let c = sessions.iter().find(|s| s.session_id == "C").unwrap();
        assert!(a.child_session_ids.contains(&"C".to_string()));
        assert_eq!(c.effective_parent(), Some("A"));
        assert!(!c.is_user_initiated);

        // Re-parent: old parent loses the child.
        handle
            .admin(AdminOp::SetParent {
                session_id: "C".to_string(),
                parent_session_id: Some("B".to_string()),
            })
            .await
            .unwrap();

        let sessions = handle.sessions(true).await;
        let a = sessions.iter().find(|s| s.session_id == "A").unwrap();
        let b = sessions.iter().find(|s| s.session_id == "B").unwrap();
        assert!(!a.child_session_ids.contains(&"C".to_string()));
        assert!(b.child_session_ids.contains(&"C".to_string()));

        // Detach entirely.
        handle
            .admin(AdminOp::SetParent {
                session_id: "C".to_string(),
                parent_session_id: None,
            })
            .await
            .unwrap();

        let sessions = handle.sessions(true).await;
        let b = sessions.iter().find(|s| s.session_id == "B").unwrap();
        let c = sessions.iter().find(|s| s.session_id == "C").unwrap();
        assert!(!b.child_session_ids.contains(&"C".to_string()));
        assert!(c.effective_parent().is_none());
        assert!(c.is_user_initiated);
    }

    #[tokio::test]
    async fn set_parent_unknown_target_is_rejected() {
        let (handle, _persist_rx) = spawn_broker();

        handle
            .ingest(event("A", HookType::SessionStart, EventKind::SessionStart, 100))
            .await;

        let err = handle
            .admin(AdminOp::SetParent {
                session_id: "A".to_string(),
                parent_session_id: Some("missing".to_string()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn rename_with_empty_label_clears_it() {
        let (handle, _persist_rx) = spawn_broker();

        handle
            .ingest(event("A", HookType::SessionStart, EventKind::SessionStart, 100))
            .await;

        handle
            .admin(AdminOp::Rename {
                session_id: "A".to_string(),
                label: Some("Release prep".to_string()),
            })
            .await
            .unwrap();
        assert_eq!(
            handle.sessions(true).await[0].label.as_deref(),
            Some("Release prep")
        );

        handle
            .admin(AdminOp::Rename {
                session_id: "A".to_string(),
                label: Some("   ".to_string()),
            })
            .await
            .unwrap();
        assert!(handle.sessions(true).await[0].label.is_none());
    }

    #[tokio::test]
    async fn delete_all_clears_state() {
        let (handle, _persist_rx) = spawn_broker();

        handle.ingest(task_spawn("S1", "reviewer", 100)).await;
        handle.ingest(tool_call("S1", "Read", 200)).await;

        handle.admin(AdminOp::DeleteAll).await.unwrap();
        assert!(handle.sessions(true).await.is_empty());

        // A fresh event after the wipe starts a clean hierarchy.
        handle.ingest(tool_call("S1", "Read", 100_000)).await;
        let sessions = handle.sessions(true).await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].session_id, "S1");
    }
}
