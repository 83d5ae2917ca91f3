//! Remote channel ingress adapter.
//!
//! Connects out to a relay over WebSocket, subscribes to one named channel,
//! and decodes each inbound frame as one event record. Connection loss is
//! recovered with tiered backoff: a few fast retries, then a longer fixed
//! delay, reset to the fast tier on any successful connect. A stopping flag
//! set before teardown keeps shutdown from racing a reconnect, and a hard
//! cap on consecutive failures parks the adapter instead of retrying
//! forever.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use skydeck_protocol::MonitorEvent;

use super::{parse_event_record, EventIngress};

const FAST_RETRY_DELAY: Duration = Duration::from_secs(1);
const FAST_RETRY_ATTEMPTS: u32 = 5;
const SLOW_RETRY_DELAY: Duration = Duration::from_secs(15);
const MAX_CONSECUTIVE_FAILURES: u32 = 60;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: String,
    pub channel: String,
    pub token: Option<String>,
}

pub struct ChannelIngress {
    config: ChannelConfig,
    handler: Option<mpsc::Sender<MonitorEvent>>,
    stopping: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl ChannelIngress {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            handler: None,
            stopping: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            task: None,
        }
    }
}

#[async_trait]
impl EventIngress for ChannelIngress {
    fn name(&self) -> &'static str {
        "channel"
    }

    fn on_event(&mut self, tx: mpsc::Sender<MonitorEvent>) {
        self.handler = Some(tx);
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let handler = self
            .handler
            .clone()
            .ok_or_else(|| anyhow::anyhow!("channel ingress started without a handler"))?;

        self.stopping.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let config = self.config.clone();
        let stopping = self.stopping.clone();
        let running = self.running.clone();
        self.task = Some(tokio::spawn(async move {
            run_channel_loop(config, handler, stopping).await;
            running.store(false, Ordering::SeqCst);
        }));
        Ok(())
    }

    async fn stop(&mut self) {
        // Flag first: the connection loop consults it before scheduling a
        // reconnect, so teardown never races a fresh attempt.
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.running.store(false, Ordering::SeqCst);
        info!(component = "ingress", "Channel adapter stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Delay before the next reconnect attempt, by consecutive failure count.
fn retry_delay(consecutive_failures: u32) -> Duration {
    if consecutive_failures <= FAST_RETRY_ATTEMPTS {
        FAST_RETRY_DELAY
    } else {
        SLOW_RETRY_DELAY
    }
}

async fn run_channel_loop(
    config: ChannelConfig,
    handler: mpsc::Sender<MonitorEvent>,
    stopping: Arc<AtomicBool>,
) {
    let mut consecutive_failures: u32 = 0;

    loop {
        if stopping.load(Ordering::SeqCst) {
            break;
        }

        match connect_async(config.url.as_str()).await {
            Ok((mut ws, _response)) => {
                consecutive_failures = 0;
                info!(
                    component = "ingress",
                    url = %config.url,
                    channel = %config.channel,
                    "Connected to relay"
                );

                let subscribe = json!({
                    "type": "subscribe",
                    "channel": config.channel,
                    "token": config.token,
                });
                if let Err(e) = ws.send(Message::Text(subscribe.to_string().into())).await {
                    warn!(component = "ingress", error = %e, "Subscribe send failed");
                } else {
                    while let Some(frame) = ws.next().await {
                        match frame {
                            Ok(Message::Text(text)) => {
                                if let Some(event) =
                                    parse_event_record(text.as_bytes(), "channel")
                                {
                                    if handler.send(event).await.is_err() {
                                        debug!(
                                            component = "ingress",
                                            "Handler closed; leaving channel loop"
                                        );
                                        return;
                                    }
                                }
                            }
                            Ok(Message::Ping(payload)) => {
                                let _ = ws.send(Message::Pong(payload)).await;
                            }
                            Ok(Message::Close(_)) => break,
                            Ok(_) => {}
                            Err(e) => {
                                warn!(component = "ingress", error = %e, "Relay read error");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                consecutive_failures += 1;
                warn!(
                    component = "ingress",
                    error = %e,
                    attempt = consecutive_failures,
                    "Relay connect failed"
                );
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    error!(
                        component = "ingress",
                        "Reconnect cap reached; channel adapter parked"
                    );
                    break;
                }
            }
        }

        if stopping.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(retry_delay(consecutive_failures)).await;
    }
}
