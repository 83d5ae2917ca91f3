//! Skydeck daemon
//!
//! Observation deck for AI coding-agent sessions: ingests hook events,
//! correlates them into a session hierarchy, supervises wrapper
//! pseudo-terminals, and streams everything to dashboards over WebSocket.

mod adapter;
mod broker;
mod control;
mod correlation;
mod logging;
mod paths;
mod persistence;
mod prompt_detector;
mod websocket;
mod wrapper;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use skydeck_protocol::{DaemonEvent, DaemonRequest};

use crate::adapter::channel::{ChannelConfig, ChannelIngress};
use crate::adapter::socket::SocketIngress;
use crate::adapter::EventIngress;
use crate::broker::Broker;
use crate::persistence::{create_persistence_channel, PersistCommand, PersistenceWriter};
use crate::websocket::AppState;
use crate::wrapper::WrapperManager;

#[derive(Parser)]
#[command(name = "skydeck", about = "Observation deck for AI coding-agent sessions")]
struct Cli {
    /// Data directory (defaults to SKYDECK_DATA_DIR, then ~/.skydeck)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the monitor daemon (the default)
    Serve(ServeArgs),
    /// Check whether a daemon is reachable on the control socket
    Status,
}

#[derive(Args)]
struct ServeArgs {
    /// Dashboard WebSocket bind address
    #[arg(long, default_value = "127.0.0.1:4400")]
    bind: SocketAddr,

    /// Event ingress transport
    #[arg(long, value_enum, default_value_t = IngressKind::Socket)]
    ingress: IngressKind,

    /// Relay URL for the channel ingress (ws://...)
    #[arg(long, env = "SKYDECK_CHANNEL_URL")]
    channel_url: Option<String>,

    /// Channel name to subscribe to on the relay
    #[arg(long, env = "SKYDECK_CHANNEL_NAME", default_value = "skydeck-events")]
    channel_name: String,

    /// Optional bearer token for the relay
    #[arg(long, env = "SKYDECK_CHANNEL_TOKEN")]
    channel_token: Option<String>,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 4400)),
            ingress: IngressKind::Socket,
            channel_url: None,
            channel_name: "skydeck-events".to_string(),
            channel_token: None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum IngressKind {
    Socket,
    Channel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    paths::init_data_dir(cli.data_dir.as_deref());

    match cli.command.unwrap_or_else(|| Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => serve(args).await,
        Command::Status => status().await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    paths::ensure_dirs()?;
    let logging_handle = logging::init_logging()?;
    info!(run_id = %logging_handle.run_id, "Starting Skydeck daemon...");

    // Persistence writer
    let (persist_tx, persist_rx) = create_persistence_channel();
    let writer = PersistenceWriter::new(persist_rx, paths::db_path());
    tokio::spawn(writer.run());

    // Restore sessions so dashboards see history across restarts.
    let restored = {
        let (reply_tx, reply_rx) = oneshot::channel();
        let _ = persist_tx
            .send(PersistCommand::LoadSessions { reply: reply_tx })
            .await;
        reply_rx.await.unwrap_or_default()
    };

    let broker = Broker::spawn(persist_tx.clone(), restored);
    let wrappers = WrapperManager::new();

    // Stopping flag: set before any socket teardown on shutdown.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Event pump: adapters dispatch into this channel, the broker drains it
    // one event at a time, which keeps correlation race-free.
    let (event_tx, mut event_rx) = mpsc::channel(1024);
    {
        let broker = broker.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                broker.ingest(event).await;
            }
        });
    }

    let mut ingress: Box<dyn EventIngress> = match args.ingress {
        IngressKind::Socket => Box::new(SocketIngress::new(paths::ingress_socket_path())),
        IngressKind::Channel => {
            let url = args
                .channel_url
                .clone()
                .ok_or_else(|| anyhow::anyhow!("--channel-url is required with --ingress channel"))?;
            Box::new(ChannelIngress::new(ChannelConfig {
                url,
                channel: args.channel_name.clone(),
                token: args.channel_token.clone(),
            }))
        }
    };
    ingress.on_event(event_tx);
    ingress.start().await?;
    info!(adapter = ingress.name(), "Event ingress started");

    {
        let wrappers = wrappers.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let path = paths::control_socket_path();
            if let Err(e) = control::run_control_socket(path, wrappers, shutdown_rx).await {
                tracing::error!(error = %e, "Control socket failed");
            }
        });
    }

    let state = Arc::new(AppState {
        broker,
        wrappers,
        persist: persist_tx,
    });
    let app = websocket::router(state);

    info!(bind = %args.bind, "Dashboard endpoint listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Flag first so close handlers skip reconnect scheduling, then teardown.
    let _ = shutdown_tx.send(true);
    ingress.stop().await;
    info!("Skydeck daemon stopped");
    Ok(())
}

async fn status() -> anyhow::Result<()> {
    let socket_path = paths::control_socket_path();
    let connect = UnixStream::connect(&socket_path);
    let stream = match tokio::time::timeout(Duration::from_secs(2), connect).await {
        Ok(Ok(stream)) => stream,
        _ => {
            println!("skydeck: not running (no daemon at {})", socket_path.display());
            return Ok(());
        }
    };

    let (read_half, mut write_half) = stream.into_split();
    let mut request = serde_json::to_string(&DaemonRequest::Ping)?;
    request.push('\n');
    write_half.write_all(request.as_bytes()).await?;

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let read = tokio::time::timeout(Duration::from_secs(2), reader.read_line(&mut line)).await;
    match read {
        Ok(Ok(n)) if n > 0 => match serde_json::from_str::<DaemonEvent>(&line) {
            Ok(DaemonEvent::Pong) => {
                println!("skydeck: running ({})", socket_path.display());
            }
            Ok(other) => {
                warn!(reply = ?other, "Unexpected control reply");
                println!("skydeck: running, but replied unexpectedly");
            }
            Err(e) => {
                println!("skydeck: unreadable reply from daemon: {e}");
            }
        },
        _ => {
            println!("skydeck: daemon did not answer ping");
        }
    }
    Ok(())
}
