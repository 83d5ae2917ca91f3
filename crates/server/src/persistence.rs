//! Persistence layer - batched SQLite writes
//!
//! Uses `spawn_blocking` for async-safe SQLite access.
//! Batches writes for better performance under high event volume; read
//! commands flush the pending batch first so callers never observe a
//! session that was saved but not yet written.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use skydeck_protocol::{MonitorEvent, SessionMeta};

/// Payloads larger than this are trimmed from list queries; the full event
/// stays available via `GetEventDetail`.
const SUMMARY_PAYLOAD_LIMIT: usize = 4096;

/// Commands that can be persisted or queried.
#[derive(Debug)]
pub enum PersistCommand {
    SaveSession(Box<SessionMeta>),
    SaveEvent(Box<MonitorEvent>),
    DeleteSession {
        session_id: String,
    },
    DeleteAllSessions,

    // Reads (reply-carrying; the writer flushes pending work first)
    LoadSessions {
        reply: oneshot::Sender<Vec<SessionMeta>>,
    },
    GetEvents {
        session_id: String,
        limit: usize,
        reply: oneshot::Sender<Vec<MonitorEvent>>,
    },
    GetAllRecentEvents {
        limit: usize,
        reply: oneshot::Sender<Vec<MonitorEvent>>,
    },
    GetEventDetail {
        session_id: String,
        event_id: String,
        reply: oneshot::Sender<Option<MonitorEvent>>,
    },
}

/// Create the persistence channel pair.
pub fn create_persistence_channel() -> (mpsc::Sender<PersistCommand>, mpsc::Receiver<PersistCommand>)
{
    mpsc::channel(1024)
}

/// Persistence writer that batches SQLite writes.
pub struct PersistenceWriter {
    rx: mpsc::Receiver<PersistCommand>,
    db_path: PathBuf,
    batch: Vec<PersistCommand>,
    batch_size: usize,
    flush_interval: Duration,
}

impl PersistenceWriter {
    pub fn new(rx: mpsc::Receiver<PersistCommand>, db_path: PathBuf) -> Self {
        Self {
            rx,
            db_path,
            batch: Vec::with_capacity(100),
            batch_size: 50,
            flush_interval: Duration::from_millis(100),
        }
    }

    /// Run the persistence writer (call from tokio::spawn).
    pub async fn run(mut self) {
        info!(db = %self.db_path.display(), "PersistenceWriter started");

        let mut interval = tokio::time::interval(self.flush_interval);

        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    if cmd.is_read() {
                        // Reads see a consistent view: drain writes first.
                        self.flush().await;
                        self.execute_read(cmd).await;
                    } else {
                        self.batch.push(cmd);
                        if self.batch.len() >= self.batch_size {
                            self.flush().await;
                        }
                    }
                }

                _ = interval.tick() => {
                    if !self.batch.is_empty() {
                        self.flush().await;
                    }
                }
            }
        }

        // Channel closed: final flush on shutdown.
        self.flush().await;
        info!("PersistenceWriter stopped");
    }

    async fn flush(&mut self) {
        if self.batch.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.batch);
        let db_path = self.db_path.clone();

        let result = tokio::task::spawn_blocking(move || flush_batch(&db_path, batch)).await;

        match result {
            Ok(Ok(count)) => {
                debug!("Persisted {} commands", count);
            }
            Ok(Err(e)) => {
                error!("Persistence flush failed: {}", e);
            }
            Err(e) => {
                error!("spawn_blocking panicked: {}", e);
            }
        }
    }

    async fn execute_read(&self, cmd: PersistCommand) {
        let db_path = self.db_path.clone();
        match cmd {
            PersistCommand::LoadSessions { reply } => {
                let result =
                    tokio::task::spawn_blocking(move || load_sessions(&db_path)).await;
                let sessions = match result {
                    Ok(Ok(s)) => s,
                    Ok(Err(e)) => {
                        error!("LoadSessions failed: {}", e);
                        Vec::new()
                    }
                    Err(e) => {
                        error!("spawn_blocking panicked: {}", e);
                        Vec::new()
                    }
                };
                let _ = reply.send(sessions);
            }
            PersistCommand::GetEvents {
                session_id,
                limit,
                reply,
            } => {
                let result = tokio::task::spawn_blocking(move || {
                    query_events(&db_path, Some(session_id.as_str()), limit)
                })
                .await;
                let _ = reply.send(unwrap_events(result));
            }
            PersistCommand::GetAllRecentEvents { limit, reply } => {
                let result =
                    tokio::task::spawn_blocking(move || query_events(&db_path, None, limit)).await;
                let _ = reply.send(unwrap_events(result));
            }
            PersistCommand::GetEventDetail {
                session_id,
                event_id,
                reply,
            } => {
                let result = tokio::task::spawn_blocking(move || {
                    query_event_detail(&db_path, &session_id, &event_id)
                })
                .await;
                let event = match result {
                    Ok(Ok(e)) => e,
                    Ok(Err(e)) => {
                        error!("GetEventDetail failed: {}", e);
                        None
                    }
                    Err(e) => {
                        error!("spawn_blocking panicked: {}", e);
                        None
                    }
                };
                let _ = reply.send(event);
            }
            _ => unreachable!("execute_read called with a write command"),
        }
    }
}

impl PersistCommand {
    fn is_read(&self) -> bool {
        matches!(
            self,
            PersistCommand::LoadSessions { .. }
                | PersistCommand::GetEvents { .. }
                | PersistCommand::GetAllRecentEvents { .. }
                | PersistCommand::GetEventDetail { .. }
        )
    }
}

fn unwrap_events(
    result: Result<Result<Vec<MonitorEvent>, rusqlite::Error>, tokio::task::JoinError>,
) -> Vec<MonitorEvent> {
    match result {
        Ok(Ok(events)) => events,
        Ok(Err(e)) => {
            error!("Event query failed: {}", e);
            Vec::new()
        }
        Err(e) => {
            error!("spawn_blocking panicked: {}", e);
            Vec::new()
        }
    }
}

fn open_db(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    ensure_schema(&conn)?;
    Ok(conn)
}

fn ensure_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS sessions (
           session_id TEXT PRIMARY KEY,
           start_time INTEGER NOT NULL,
           hidden INTEGER NOT NULL DEFAULT 0,
           data TEXT NOT NULL
         );
         CREATE TABLE IF NOT EXISTS events (
           id TEXT PRIMARY KEY,
           session_id TEXT NOT NULL,
           timestamp INTEGER NOT NULL,
           data TEXT NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_events_session ON events(session_id, timestamp);
         CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);",
    )
}

/// Flush a batch of commands to SQLite (runs in blocking thread).
fn flush_batch(db_path: &PathBuf, batch: Vec<PersistCommand>) -> Result<usize, rusqlite::Error> {
    let conn = open_db(db_path)?;

    let count = batch.len();
    let tx = conn.unchecked_transaction()?;

    for cmd in batch {
        if let Err(e) = execute_command(&tx, cmd) {
            warn!("Failed to execute command: {}", e);
            // Continue with other commands
        }
    }

    tx.commit()?;

    Ok(count)
}

fn execute_command(conn: &Connection, cmd: PersistCommand) -> Result<(), rusqlite::Error> {
    match cmd {
        PersistCommand::SaveSession(session) => {
            let data = serde_json::to_string(&session)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            conn.execute(
                "INSERT INTO sessions (session_id, start_time, hidden, data)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id) DO UPDATE SET
                   start_time = ?2,
                   hidden = ?3,
                   data = ?4",
                params![
                    session.session_id,
                    session.start_time as i64,
                    session.hidden as i64,
                    data
                ],
            )?;
        }

        PersistCommand::SaveEvent(event) => {
            let data = serde_json::to_string(&event)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            conn.execute(
                "INSERT OR REPLACE INTO events (id, session_id, timestamp, data)
                 VALUES (?1, ?2, ?3, ?4)",
                params![event.id, event.session_id, event.timestamp as i64, data],
            )?;
        }

        PersistCommand::DeleteSession { session_id } => {
            conn.execute(
                "DELETE FROM events WHERE session_id = ?1",
                params![session_id],
            )?;
            conn.execute(
                "DELETE FROM sessions WHERE session_id = ?1",
                params![session_id],
            )?;
        }

        PersistCommand::DeleteAllSessions => {
            conn.execute("DELETE FROM events", [])?;
            conn.execute("DELETE FROM sessions", [])?;
        }

        _ => unreachable!("read command reached the write path"),
    }
    Ok(())
}

fn load_sessions(db_path: &Path) -> Result<Vec<SessionMeta>, rusqlite::Error> {
    let conn = open_db(db_path)?;
    let mut stmt = conn.prepare("SELECT data FROM sessions ORDER BY start_time ASC")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

    let mut sessions = Vec::new();
    for row in rows {
        let raw = row?;
        match serde_json::from_str::<SessionMeta>(&raw) {
            Ok(session) => sessions.push(session),
            Err(e) => warn!("Skipping unreadable session row: {}", e),
        }
    }
    Ok(sessions)
}

fn query_events(
    db_path: &Path,
    session_id: Option<&str>,
    limit: usize,
) -> Result<Vec<MonitorEvent>, rusqlite::Error> {
    let conn = open_db(db_path)?;

    let mut events = Vec::new();
    let collect = |raw: String, events: &mut Vec<MonitorEvent>| {
        match serde_json::from_str::<MonitorEvent>(&raw) {
            Ok(event) => events.push(summarize_event(event)),
            Err(e) => warn!("Skipping unreadable event row: {}", e),
        }
    };

    if let Some(session_id) = session_id {
        let mut stmt = conn.prepare(
            "SELECT data FROM events WHERE session_id = ?1
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], |row| {
            row.get::<_, String>(0)
        })?;
        for row in rows {
            collect(row?, &mut events);
        }
    } else {
        let mut stmt =
            conn.prepare("SELECT data FROM events ORDER BY timestamp DESC LIMIT ?1")?;
        let rows = stmt.query_map(params![limit as i64], |row| row.get::<_, String>(0))?;
        for row in rows {
            collect(row?, &mut events);
        }
    }

    // Queries run newest-first for the LIMIT; hand back chronological order.
    events.reverse();
    Ok(events)
}

fn query_event_detail(
    db_path: &Path,
    session_id: &str,
    event_id: &str,
) -> Result<Option<MonitorEvent>, rusqlite::Error> {
    let conn = open_db(db_path)?;
    let mut stmt =
        conn.prepare("SELECT data FROM events WHERE session_id = ?1 AND id = ?2")?;
    let mut rows = stmt.query_map(params![session_id, event_id], |row| {
        row.get::<_, String>(0)
    })?;

    match rows.next() {
        Some(row) => {
            let raw = row?;
            match serde_json::from_str::<MonitorEvent>(&raw) {
                Ok(event) => Ok(Some(event)),
                Err(e) => {
                    warn!("Unreadable event row for {}: {}", event_id, e);
                    Ok(None)
                }
            }
        }
        None => Ok(None),
    }
}

/// Trim oversized payloads out of list responses. Full chain-of-thought
/// blocks and tool outputs can run to hundreds of kilobytes; dashboards
/// lazy-load them through `GetEventDetail`.
fn summarize_event(mut event: MonitorEvent) -> MonitorEvent {
    let serialized_len = event.data.to_string().len();
    if serialized_len <= SUMMARY_PAYLOAD_LIMIT {
        return event;
    }

    let tool_name = event.tool_name().map(str::to_string);
    let mut trimmed = serde_json::Map::new();
    trimmed.insert("truncated".to_string(), Value::Bool(true));
    trimmed.insert(
        "original_size".to_string(),
        Value::from(serialized_len as u64),
    );
    if let Some(name) = tool_name {
        trimmed.insert("tool_name".to_string(), Value::String(name));
    }
    event.data = Value::Object(trimmed);
    event
}

#[cfg(test)]
mod tests {
    use super::*;
    use skydeck_protocol::{EventKind, HookType, SessionStatus, TokenUsage};

    fn sample_session(id: &str) -> SessionMeta {
        SessionMeta {
            session_id: id.to_string(),
            parent_session_id: None,
            manual_parent_session_id: None,
            agent_type: None,
            child_session_ids: Vec::new(),
            status: SessionStatus::Active,
            start_time: 1_000,
            end_time: None,
            token_usage: TokenUsage::default(),
            is_user_initiated: true,
            is_pinned: true,
            hidden: false,
            label: None,
            working_directory: "/tmp/project".to_string(),
            machine_id: "mac-1".to_string(),
            last_event_at: 1_000,
        }
    }

    fn sample_event(id: &str, session_id: &str, timestamp: u64) -> MonitorEvent {
        MonitorEvent {
            id: id.to_string(),
            session_id: session_id.to_string(),
            machine_id: "mac-1".to_string(),
            working_directory: "/tmp/project".to_string(),
            timestamp,
            hook_type: HookType::PreToolUse,
            event_type: EventKind::ToolCall,
            data: serde_json::json!({"tool_name": "Bash"}),
            parent_session_id: None,
        }
    }

    async fn spawn_writer(dir: &tempfile::TempDir) -> mpsc::Sender<PersistCommand> {
        let (tx, rx) = create_persistence_channel();
        let writer = PersistenceWriter::new(rx, dir.path().join("test.db"));
        tokio::spawn(writer.run());
        tx
    }

    #[tokio::test]
    async fn save_then_load_roundtrips_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let tx = spawn_writer(&dir).await;

        tx.send(PersistCommand::SaveSession(Box::new(sample_session("s1"))))
            .await
            .unwrap();
        tx.send(PersistCommand::SaveSession(Box::new(sample_session("s2"))))
            .await
            .unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PersistCommand::LoadSessions { reply: reply_tx })
            .await
            .unwrap();
        let sessions = reply_rx.await.unwrap();

        assert_eq!(sessions.len(), 2);
        assert!(sessions.iter().any(|s| s.session_id == "s1"));
    }

    #[tokio::test]
    async fn delete_session_removes_session_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let tx = spawn_writer(&dir).await;

        tx.send(PersistCommand::SaveSession(Box::new(sample_session("s1"))))
            .await
            .unwrap();
        tx.send(PersistCommand::SaveEvent(Box::new(sample_event(
            "e1", "s1", 10,
        ))))
        .await
        .unwrap();
        tx.send(PersistCommand::DeleteSession {
            session_id: "s1".to_string(),
        })
        .await
        .unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PersistCommand::LoadSessions { reply: reply_tx })
            .await
            .unwrap();
        assert!(reply_rx.await.unwrap().is_empty());

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PersistCommand::GetEvents {
            session_id: "s1".to_string(),
            limit: 10,
            reply: reply_tx,
        })
        .await
        .unwrap();
        assert!(reply_rx.await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_events_respects_limit_and_order() {
        let dir = tempfile::tempdir().unwrap();
        let tx = spawn_writer(&dir).await;

        for i in 0..5u64 {
            tx.send(PersistCommand::SaveEvent(Box::new(sample_event(
                &format!("e{i}"),
                "s1",
                i * 100,
            ))))
            .await
            .unwrap();
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PersistCommand::GetEvents {
            session_id: "s1".to_string(),
            limit: 3,
            reply: reply_tx,
        })
        .await
        .unwrap();
        let events = reply_rx.await.unwrap();

        // Last three, chronological.
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].id, "e2");
        assert_eq!(events[2].id, "e4");
    }

    #[tokio::test]
    async fn event_detail_returns_full_payload_while_list_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let tx = spawn_writer(&dir).await;

        let mut event = sample_event("big", "s1", 10);
        event.data = serde_json::json!({
            "tool_name": "Bash",
            "thinking": "x".repeat(SUMMARY_PAYLOAD_LIMIT * 2),
        });
        tx.send(PersistCommand::SaveEvent(Box::new(event)))
            .await
            .unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PersistCommand::GetEvents {
            session_id: "s1".to_string(),
            limit: 10,
            reply: reply_tx,
        })
        .await
        .unwrap();
        let listed = reply_rx.await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].data.get("truncated"), Some(&Value::Bool(true)));
        assert_eq!(
            listed[0].data.get("tool_name").and_then(Value::as_str),
            Some("Bash")
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PersistCommand::GetEventDetail {
            session_id: "s1".to_string(),
            event_id: "big".to_string(),
            reply: reply_tx,
        })
        .await
        .unwrap();
        let full = reply_rx.await.unwrap().expect("event detail");
        assert!(full
            .data
            .get("thinking")
            .and_then(Value::as_str)
            .unwrap()
            .len()
            > SUMMARY_PAYLOAD_LIMIT);
    }

    #[tokio::test]
    async fn delete_all_clears_everything() {
        let dir = tempfile::tempdir().unwrap();
        let tx = spawn_writer(&dir).await;

        tx.send(PersistCommand::SaveSession(Box::new(sample_session("s1"))))
            .await
            .unwrap();
        tx.send(PersistCommand::SaveEvent(Box::new(sample_event(
            "e1", "s1", 10,
        ))))
        .await
        .unwrap();
        tx.send(PersistCommand::DeleteAllSessions).await.unwrap();

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(PersistCommand::GetAllRecentEvents {
            limit: 10,
            reply: reply_tx,
        })
        .await
        .unwrap();
        assert!(reply_rx.await.unwrap().is_empty());
    }
}
