//! Dashboard WebSocket server.
//!
//! Each connection gets an outbound queue and a writer task; a forwarder
//! task fans broker and wrapper notifications out according to the
//! connection's subscription scope. Event notifications go only to "all"
//! subscribers or the matching session's subscribers; session list updates
//! go to every connection, so two open dashboards stay consistent.
//! Administrative failures come back as an `error` message to the requester
//! only — never silence, never a disconnect.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use skydeck_protocol::{
    client::{AllScope, SubscriptionScope},
    ClientMessage, MonitorEvent, ServerMessage,
};

use crate::broker::{AdminOp, BrokerHandle, BrokerNotification};
use crate::persistence::PersistCommand;
use crate::wrapper::{WrapperEvent, WrapperManager};

const OUTBOUND_BUFFER: usize = 256;
const DEFAULT_EVENTS_LIMIT: usize = 200;
const DEFAULT_RECENT_EVENTS_LIMIT: usize = 500;

/// Shared handles every dashboard connection works against.
pub struct AppState {
    pub broker: BrokerHandle,
    pub wrappers: Arc<WrapperManager>,
    pub persist: mpsc::Sender<PersistCommand>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    "OK"
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// What a connection has asked to observe.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum Scope {
    /// Nothing yet: session list updates only.
    #[default]
    None,
    All,
    Session(String),
}

impl Scope {
    fn wants_event(&self, event: &MonitorEvent) -> bool {
        match self {
            Scope::None => false,
            Scope::All => true,
            Scope::Session(id) => *id == event.session_id,
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);

    let writer_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let Ok(json) = serde_json::to_string(&msg) else {
                continue;
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let scope = Arc::new(RwLock::new(Scope::default()));

    let forwarder_task = {
        let out_tx = out_tx.clone();
        let scope = scope.clone();
        let broker_rx = state.broker.subscribe();
        let wrapper_rx = state.wrappers.subscribe();
        tokio::spawn(forward_notifications(broker_rx, wrapper_rx, out_tx, scope))
    };

    while let Some(frame) = ws_rx.next().await {
        let msg = match frame {
            Ok(msg) => msg,
            Err(e) => {
                debug!(component = "dashboard", error = %e, "WebSocket read error");
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(client_msg) => {
                    handle_client_message(client_msg, &state, &out_tx, &scope).await;
                }
                Err(e) => {
                    warn!(component = "dashboard", error = %e, "Malformed client message");
                    let _ = out_tx
                        .send(ServerMessage::Error {
                            message: format!("invalid message: {e}"),
                        })
                        .await;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    forwarder_task.abort();
    drop(out_tx);
    let _ = writer_task.await;
    debug!(component = "dashboard", "Dashboard connection closed");
}

async fn forward_notifications(
    mut broker_rx: broadcast::Receiver<BrokerNotification>,
    mut wrapper_rx: broadcast::Receiver<WrapperEvent>,
    out_tx: mpsc::Sender<ServerMessage>,
    scope: Arc<RwLock<Scope>>,
) {
    loop {
        tokio::select! {
            notification = broker_rx.recv() => match notification {
                Ok(notification) => {
                    let current = scope.read().await.clone();
                    if let Some(msg) = route_notification(notification, &current) {
                        if out_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(component = "dashboard", skipped, "Client lagged broker stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = wrapper_rx.recv() => match event {
                Ok(event) => {
                    if out_tx.send(wrapper_event_message(event)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(component = "dashboard", skipped, "Client lagged wrapper stream");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Decide what a broker notification means for one connection.
fn route_notification(
    notification: BrokerNotification,
    scope: &Scope,
) -> Option<ServerMessage> {
    match notification {
        BrokerNotification::Event { event } => scope
            .wants_event(&event)
            .then_some(ServerMessage::Event { event }),
        // The session list is always global.
        BrokerNotification::SessionCreated { session }
        | BrokerNotification::SessionUpdated { session } => {
            Some(ServerMessage::SessionUpdate { session })
        }
        BrokerNotification::SessionsChanged => Some(ServerMessage::SessionsUpdated),
    }
}

fn wrapper_event_message(event: WrapperEvent) -> ServerMessage {
    match event {
        WrapperEvent::Started { wrapper } => ServerMessage::WrapperConnected { wrapper },
        WrapperEvent::Output { wrapper_id, data } => {
            ServerMessage::WrapperOutput { wrapper_id, data }
        }
        WrapperEvent::StateChanged { wrapper_id, state } => {
            ServerMessage::WrapperState { wrapper_id, state }
        }
        WrapperEvent::Ended {
            wrapper_id,
            exit_code,
        } => ServerMessage::WrapperDisconnected {
            wrapper_id,
            exit_code,
        },
    }
}

async fn handle_client_message(
    msg: ClientMessage,
    state: &Arc<AppState>,
    out_tx: &mpsc::Sender<ServerMessage>,
    scope: &Arc<RwLock<Scope>>,
) {
    match msg {
        ClientMessage::Subscribe { scope: requested } => {
            let next = match requested {
                SubscriptionScope::All(AllScope::All) => Scope::All,
                SubscriptionScope::Session { session_id } => Scope::Session(session_id),
            };
            *scope.write().await = next;
        }

        ClientMessage::GetSessions { include_hidden } => {
            let sessions = state.broker.sessions(include_hidden).await;
            let _ = out_tx.send(ServerMessage::Sessions { sessions }).await;
        }

        ClientMessage::GetEvents { session_id, limit } => {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            let _ = state
                .persist
                .send(PersistCommand::GetEvents {
                    session_id: session_id.clone(),
                    limit: limit.unwrap_or(DEFAULT_EVENTS_LIMIT),
                    reply: reply_tx,
                })
                .await;
            let events = reply_rx.await.unwrap_or_default();
            let _ = out_tx
                .send(ServerMessage::Events { session_id, events })
                .await;
        }

        ClientMessage::GetAllRecentEvents { limit } => {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            let _ = state
                .persist
                .send(PersistCommand::GetAllRecentEvents {
                    limit: limit.unwrap_or(DEFAULT_RECENT_EVENTS_LIMIT),
                    reply: reply_tx,
                })
                .await;
            let events = reply_rx.await.unwrap_or_default();
            let _ = out_tx.send(ServerMessage::AllEvents { events }).await;
        }

        ClientMessage::GetEventDetail {
            session_id,
            event_id,
        } => {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            let _ = state
                .persist
                .send(PersistCommand::GetEventDetail {
                    session_id: session_id.clone(),
                    event_id,
                    reply: reply_tx,
                })
                .await;
            let event = reply_rx.await.unwrap_or(None);
            let _ = out_tx
                .send(ServerMessage::EventDetail { session_id, event })
                .await;
        }

        // Administrative operations. Success is announced to every
        // connection through broker notifications; failures only to the
        // requester.
        ClientMessage::HideSession { session_id } => {
            run_admin(
                state,
                out_tx,
                AdminOp::Hide {
                    session_id,
                    hidden: true,
                },
            )
            .await;
        }
        ClientMessage::UnhideSession { session_id } => {
            run_admin(
                state,
                out_tx,
                AdminOp::Hide {
                    session_id,
                    hidden: false,
                },
            )
            .await;
        }
        ClientMessage::DeleteSession { session_id } => {
            run_admin(state, out_tx, AdminOp::Delete { session_id }).await;
        }
        ClientMessage::HideAllSessions => {
            run_admin(state, out_tx, AdminOp::HideAll).await;
        }
        ClientMessage::DeleteAllSessions => {
            run_admin(state, out_tx, AdminOp::DeleteAll).await;
        }
        ClientMessage::SetParent {
            session_id,
            parent_session_id,
        } => {
            run_admin(
                state,
                out_tx,
                AdminOp::SetParent {
                    session_id,
                    parent_session_id,
                },
            )
            .await;
        }
        ClientMessage::TogglePin { session_id } => {
            run_admin(state, out_tx, AdminOp::TogglePin { session_id }).await;
        }
        ClientMessage::SetUserInitiated {
            session_id,
            is_user_initiated,
        } => {
            run_admin(
                state,
                out_tx,
                AdminOp::SetUserInitiated {
                    session_id,
                    value: is_user_initiated,
                },
            )
            .await;
        }
        ClientMessage::RenameSession { session_id, label } => {
            run_admin(state, out_tx, AdminOp::Rename { session_id, label }).await;
        }

        ClientMessage::GetWrappers => {
            let wrappers = state.wrappers.list();
            let replay: Vec<(String, String)> = wrappers
                .iter()
                .filter_map(|w| {
                    state
                        .wrappers
                        .history(&w.wrapper_id)
                        .ok()
                        .filter(|h| !h.is_empty())
                        .map(|h| (w.wrapper_id.clone(), h))
                })
                .collect();
            let _ = out_tx.send(ServerMessage::WrappersList { wrappers }).await;
            // Replay buffered output so a reconnecting dashboard has context.
            for (wrapper_id, data) in replay {
                let _ = out_tx
                    .send(ServerMessage::WrapperOutput { wrapper_id, data })
                    .await;
            }
        }

        ClientMessage::InjectInput { wrapper_id, input } => {
            if let Err(e) = state.wrappers.inject_input(&wrapper_id, &input) {
                let _ = out_tx
                    .send(ServerMessage::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }

        ClientMessage::ResizeWrapper {
            wrapper_id,
            cols,
            rows,
        } => {
            if let Err(e) = state.wrappers.resize(&wrapper_id, cols, rows) {
                let _ = out_tx
                    .send(ServerMessage::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }
}

async fn run_admin(state: &Arc<AppState>, out_tx: &mpsc::Sender<ServerMessage>, op: AdminOp) {
    if let Err(e) = state.broker.admin(op).await {
        let _ = out_tx
            .send(ServerMessage::Error {
                message: e.to_string(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use skydeck_protocol::{EventKind, HookType, SessionMeta, SessionStatus, TokenUsage};
    use tokio::time::{timeout, Duration};

    fn sample_event(session_id: &str) -> MonitorEvent {
        MonitorEvent {
            id: "e1".to_string(),
            session_id: session_id.to_string(),
            machine_id: "m1".to_string(),
            working_directory: "/tmp".to_string(),
            timestamp: 1,
            hook_type: HookType::Stop,
            event_type: EventKind::Message,
            data: Value::Null,
            parent_session_id: None,
        }
    }

    fn sample_session(id: &str) -> SessionMeta {
        SessionMeta {
            session_id: id.to_string(),
            parent_session_id: None,
            manual_parent_session_id: None,
            agent_type: None,
            child_session_ids: Vec::new(),
            status: SessionStatus::Active,
            start_time: 1,
            end_time: None,
            token_usage: TokenUsage::default(),
            is_user_initiated: true,
            is_pinned: false,
            hidden: false,
            label: None,
            working_directory: "/tmp".to_string(),
            machine_id: "m1".to_string(),
            last_event_at: 1,
        }
    }

    #[test]
    fn events_route_by_scope() {
        let notification = BrokerNotification::Event {
            event: sample_event("s1"),
        };
        assert!(route_notification(notification.clone(), &Scope::All).is_some());
        assert!(
            route_notification(notification.clone(), &Scope::Session("s1".into())).is_some()
        );
        assert!(
            route_notification(notification.clone(), &Scope::Session("other".into())).is_none()
        );
        assert!(route_notification(notification, &Scope::None).is_none());
    }

    #[test]
    fn session_updates_reach_every_scope() {
        for scope in [Scope::None, Scope::All, Scope::Session("other".into())] {
            let created = BrokerNotification::SessionCreated {
                session: sample_session("s1"),
            };
            assert!(route_notification(created, &scope).is_some());

            let bulk = BrokerNotification::SessionsChanged;
            assert!(matches!(
                route_notification(bulk, &scope),
                Some(ServerMessage::SessionsUpdated)
            ));
        }
    }

    #[tokio::test]
    async fn dashboard_roundtrip_over_real_websocket() {
        use futures::{SinkExt as _, StreamExt as _};
        use tokio_tungstenite::tungstenite::Message as WsMessage;

        let (persist_tx, mut persist_rx) = mpsc::channel(64);
        // Queries need a live store; answer them with nothing.
        tokio::spawn(async move {
            while let Some(cmd) = persist_rx.recv().await {
                if let PersistCommand::GetEvents { reply, .. } = cmd {
                    let _ = reply.send(Vec::new());
                }
            }
        });

        let broker = crate::broker::Broker::spawn(persist_tx.clone(), Vec::new());
        let state = Arc::new(AppState {
            broker: broker.clone(),
            wrappers: WrapperManager::new(),
            persist: persist_tx,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .expect("dashboard connects");

        // Subscribe to everything, then feed an event through the broker.
        ws.send(WsMessage::Text(
            r#"{"type":"subscribe","scope":"all"}"#.into(),
        ))
        .await
        .unwrap();
        ws.send(WsMessage::Text(r#"{"type":"get_sessions"}"#.into()))
            .await
            .unwrap();

        // First reply: empty session list.
        let reply = timeout(Duration::from_secs(3), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let parsed: ServerMessage = serde_json::from_str(reply.to_text().unwrap()).unwrap();
        assert!(matches!(parsed, ServerMessage::Sessions { ref sessions } if sessions.is_empty()));

        broker.ingest(sample_event("s1")).await;

        // The connection then sees the session creation and the event.
        let mut saw_session = false;
        let mut saw_event = false;
        for _ in 0..4 {
            let frame = timeout(Duration::from_secs(3), ws.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            match serde_json::from_str::<ServerMessage>(frame.to_text().unwrap()).unwrap() {
                ServerMessage::SessionUpdate { session } => {
                    assert_eq!(session.session_id, "s1");
                    saw_session = true;
                }
                ServerMessage::Event { event } => {
                    assert_eq!(event.session_id, "s1");
                    saw_event = true;
                }
                _ => {}
            }
            if saw_session && saw_event {
                break;
            }
        }
        assert!(saw_session && saw_event);

        // Unknown-session admin op produces an explicit error, not silence.
        ws.send(WsMessage::Text(
            r#"{"type":"delete_session","session_id":"missing"}"#.into(),
        ))
        .await
        .unwrap();
        let frame = timeout(Duration::from_secs(3), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let parsed: ServerMessage = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        match parsed {
            ServerMessage::Error { message } => assert!(message.contains("missing")),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
