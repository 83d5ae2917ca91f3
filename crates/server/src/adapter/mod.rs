//! Transport adapters — interchangeable event ingress.
//!
//! Adapters parse and dispatch raw hook-event records; they hold no session
//! state. Both implementations deliver events into a registered channel and
//! never let one malformed record take down the listener.

pub mod channel;
pub mod socket;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use skydeck_protocol::MonitorEvent;

#[async_trait]
pub trait EventIngress: Send {
    fn name(&self) -> &'static str;

    /// Register the channel parsed events are dispatched into.
    /// Must be called before `start`.
    fn on_event(&mut self, tx: mpsc::Sender<MonitorEvent>);

    async fn start(&mut self) -> anyhow::Result<()>;

    /// Stop the adapter. Sets the stopping flag before any socket teardown so
    /// close handlers never race a reconnect against shutdown.
    async fn stop(&mut self);

    #[allow(dead_code)]
    fn is_running(&self) -> bool;
}

/// Parse one event record. Whitespace-only input is skipped silently;
/// malformed JSON is dropped with a log line and processing continues.
pub(crate) fn parse_event_record(raw: &[u8], source: &str) -> Option<MonitorEvent> {
    if raw.iter().all(|b| b.is_ascii_whitespace()) {
        return None;
    }
    match serde_json::from_slice::<MonitorEvent>(raw) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(
                component = "ingress",
                source, error = %e,
                "Dropping malformed event record"
            );
            None
        }
    }
}
