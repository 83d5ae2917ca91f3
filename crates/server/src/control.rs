//! Daemon control channel.
//!
//! Newline-delimited JSON over a Unix socket. The CLI uses it to spawn,
//! attach, list and kill wrappers; wrapper hosts use it to report state and
//! receive injected input. Wrapper lifecycle and output stream to every
//! connected control client, so a client that attaches mid-session still
//! sees subsequent activity.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{unix::OwnedWriteHalf, UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use skydeck_protocol::{DaemonEvent, DaemonRequest};

use crate::wrapper::{WrapperEvent, WrapperManager};

const CLIENT_BUFFER: usize = 64;

/// Run the control socket until the shutdown flag flips.
pub async fn run_control_socket(
    socket_path: PathBuf,
    manager: Arc<WrapperManager>,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if socket_path.exists() {
        let _ = fs::remove_file(&socket_path);
    }

    let listener = UnixListener::bind(&socket_path)?;
    // Control is owner-only; only the user's own CLI and wrappers attach.
    let _ = fs::set_permissions(&socket_path, fs::Permissions::from_mode(0o600));

    info!(
        component = "control",
        socket = %socket_path.display(),
        "Control socket listening"
    );

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _addr)) => {
                        let manager = manager.clone();
                        tokio::spawn(handle_connection(stream, manager));
                    }
                    Err(e) => {
                        warn!(component = "control", error = %e, "accept failed");
                    }
                }
            }
        }
    }

    let _ = fs::remove_file(&socket_path);
    info!(component = "control", "Control socket stopped");
    Ok(())
}

async fn handle_connection(stream: UnixStream, manager: Arc<WrapperManager>) {
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = mpsc::channel::<DaemonEvent>(CLIENT_BUFFER);

    let writer_task = tokio::spawn(writer_loop(write_half, rx));
    let forwarder_task = tokio::spawn(forward_wrapper_events(manager.subscribe(), tx.clone()));

    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if line.iter().all(|b| b.is_ascii_whitespace()) {
                    continue;
                }
                match serde_json::from_slice::<DaemonRequest>(&line) {
                    Ok(request) => {
                        if let Some(reply) = handle_request(request, &manager) {
                            if tx.send(reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        warn!(component = "control", error = %e, "Malformed control request");
                        let _ = tx
                            .send(DaemonEvent::Error {
                                message: format!("invalid request: {e}"),
                            })
                            .await;
                    }
                }
            }
            Err(e) => {
                warn!(component = "control", error = %e, "Control read error");
                break;
            }
        }
    }

    forwarder_task.abort();
    drop(tx);
    let _ = writer_task.await;
    debug!(component = "control", "Control connection closed");
}

fn handle_request(request: DaemonRequest, manager: &Arc<WrapperManager>) -> Option<DaemonEvent> {
    match request {
        DaemonRequest::SpawnWrapper {
            args,
            cwd,
            size,
            prompt,
        } => Some(match manager.spawn_wrapper(args, cwd, size, prompt) {
            Ok(summary) => DaemonEvent::WrapperSpawned {
                ok: true,
                wrapper_id: Some(summary.wrapper_id),
                error: None,
            },
            Err(e) => DaemonEvent::WrapperSpawned {
                ok: false,
                wrapper_id: None,
                error: Some(e.to_string()),
            },
        }),

        DaemonRequest::WrapperRegister {
            wrapper_id,
            pid,
            cwd,
            tty,
        } => {
            manager.register_external(wrapper_id, pid, cwd, tty);
            // The broadcast wrapper_started event covers the reply.
            None
        }

        DaemonRequest::GetWrappers => Some(DaemonEvent::WrappersList {
            wrappers: manager.list(),
        }),

        DaemonRequest::KillWrapper { wrapper_id } => match manager.kill(&wrapper_id) {
            Ok(()) => None,
            Err(e) => Some(DaemonEvent::Error {
                message: e.to_string(),
            }),
        },

        DaemonRequest::InjectInput { wrapper_id, input } => {
            match manager.inject_input(&wrapper_id, &input) {
                Ok(()) => None,
                Err(e) => Some(DaemonEvent::Error {
                    message: e.to_string(),
                }),
            }
        }

        DaemonRequest::StateUpdate {
            wrapper_id,
            state,
            claude_session_id,
        } => match manager.report_state(&wrapper_id, state, claude_session_id) {
            Ok(()) => None,
            Err(e) => Some(DaemonEvent::Error {
                message: e.to_string(),
            }),
        },

        DaemonRequest::ResizeWrapper {
            wrapper_id,
            cols,
            rows,
        } => match manager.resize(&wrapper_id, cols, rows) {
            Ok(()) => None,
            Err(e) => Some(DaemonEvent::Error {
                message: e.to_string(),
            }),
        },

        DaemonRequest::Ping => Some(DaemonEvent::Pong),
    }
}

async fn writer_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<DaemonEvent>) {
    while let Some(event) = rx.recv().await {
        let Ok(mut json) = serde_json::to_string(&event) else {
            continue;
        };
        json.push('\n');
        if writer.write_all(json.as_bytes()).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
    }
}

async fn forward_wrapper_events(
    mut events: broadcast::Receiver<WrapperEvent>,
    tx: mpsc::Sender<DaemonEvent>,
) {
    loop {
        match events.recv().await {
            Ok(event) => {
                let msg = match event {
                    WrapperEvent::Started { wrapper } => DaemonEvent::WrapperStarted { wrapper },
                    WrapperEvent::Output { wrapper_id, data } => {
                        DaemonEvent::Output { wrapper_id, data }
                    }
                    WrapperEvent::StateChanged { wrapper_id, state } => {
                        DaemonEvent::StateChanged { wrapper_id, state }
                    }
                    WrapperEvent::Ended {
                        wrapper_id,
                        exit_code,
                    } => DaemonEvent::WrapperEnded {
                        wrapper_id,
                        exit_code,
                    },
                };
                if tx.send(msg).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(
                    component = "control",
                    skipped, "Control client lagged behind wrapper events"
                );
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
