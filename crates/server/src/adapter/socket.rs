//! Local-socket ingress adapter.
//!
//! Listens on a well-known Unix domain socket and reads each inbound
//! connection as a stream of newline-delimited event records. Permissions
//! are relaxed so any local process (hook scripts run as the user) can
//! connect. Events from one connection are delivered in arrival order; no
//! ordering holds across connections.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use skydeck_protocol::MonitorEvent;

use super::{parse_event_record, EventIngress};

pub struct SocketIngress {
    socket_path: PathBuf,
    handler: Option<mpsc::Sender<MonitorEvent>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl SocketIngress {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            handler: None,
            shutdown_tx: None,
            accept_task: None,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Emitter-side send: write one event record to a listening daemon.
    /// Hook scripts do the equivalent with a shell one-liner.
    #[allow(dead_code)]
    pub async fn publish(
        socket_path: &std::path::Path,
        event: &MonitorEvent,
    ) -> std::io::Result<()> {
        let mut stream = UnixStream::connect(socket_path).await?;
        let mut line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        line.push('\n');
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await
    }
}

#[async_trait]
impl EventIngress for SocketIngress {
    fn name(&self) -> &'static str {
        "socket"
    }

    fn on_event(&mut self, tx: mpsc::Sender<MonitorEvent>) {
        self.handler = Some(tx);
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| anyhow::anyhow!("socket ingress started without a handler"))?;

        if let Some(parent) = self.socket_path.parent() {
            fs::create_dir_all(parent)?;
        }
        // A previous daemon may have left the socket file behind.
        if self.socket_path.exists() {
            let _ = fs::remove_file(&self.socket_path);
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        // Hook scripts run as arbitrary local processes.
        let _ = fs::set_permissions(&self.socket_path, fs::Permissions::from_mode(0o666));

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);
        self.running.store(true, Ordering::SeqCst);

        info!(
            component = "ingress",
            socket = %self.socket_path.display(),
            "Event socket listening"
        );

        let running = self.running.clone();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                    accept = listener.accept() => {
                        match accept {
                            Ok((stream, _addr)) => {
                                let handler = handler.clone();
                                tokio::spawn(read_connection(stream, handler));
                            }
                            Err(e) => {
                                warn!(component = "ingress", error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
            running.store(false, Ordering::SeqCst);
        }));

        Ok(())
    }

    async fn stop(&mut self) {
        // Flag first, then teardown.
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        let _ = fs::remove_file(&self.socket_path);
        self.running.store(false, Ordering::SeqCst);
        info!(component = "ingress", "Event socket stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Read one connection until EOF. Partial lines buffer until the terminator
/// arrives; a malformed line is dropped, never fatal.
async fn read_connection(stream: UnixStream, handler: mpsc::Sender<MonitorEvent>) {
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if let Some(event) = parse_event_record(&line, "socket") {
                    if handler.send(event).await.is_err() {
                        debug!(component = "ingress", "Handler closed; dropping connection");
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(component = "ingress", error = %e, "Connection read error");
                break;
            }
        }
    }
}
