//! Wrapper session manager — supervises pseudo-terminal agent processes.
//!
//! Each wrapper is one PTY-hosted interactive agent session that outlives
//! the CLI that requested it. The daemon owns the child handle and an exit
//! notification path; liveness is never re-derived from a stored PID. Output
//! is streamed to observers, kept in a bounded ring buffer for reconnecting
//! dashboards, and fed to the input-wait heuristic.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use skydeck_protocol::{TerminalSize, WrapperState, WrapperSummary};

use crate::prompt_detector::PromptDetector;

/// Delay before an idle freshly-started wrapper is considered waiting.
const SETTLE_DELAY: Duration = Duration::from_millis(1500);

/// Byte cap on the per-wrapper output ring buffer.
const OUTPUT_HISTORY_BYTES: usize = 64 * 1024;

/// Command run when a spawn request carries no argv.
const DEFAULT_AGENT_COMMAND: &str = "claude";

const EVENT_BUFFER: usize = 256;
const OUTPUT_CHUNK_BUFFER: usize = 64;

#[derive(Debug, Error)]
pub enum WrapperError {
    #[error("wrapper not found: {0}")]
    NotFound(String),
    #[error("input rejected for {wrapper_id}: wrapper is {state:?}")]
    InputRejected {
        wrapper_id: String,
        state: WrapperState,
    },
    #[error("wrapper {0} has no attached pseudo-terminal")]
    NoTerminal(String),
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("wrapper io: {0}")]
    Io(String),
}

/// Lifecycle and I/O events emitted to observers (control clients, dashboards).
#[derive(Debug, Clone)]
pub enum WrapperEvent {
    Started { wrapper: WrapperSummary },
    Output { wrapper_id: String, data: String },
    StateChanged {
        wrapper_id: String,
        state: WrapperState,
    },
    Ended {
        wrapper_id: String,
        exit_code: Option<i32>,
    },
}

struct WrapperRuntime {
    state: WrapperState,
    claude_session_id: Option<String>,
    detector: PromptDetector,
    history: VecDeque<String>,
    history_bytes: usize,
}

struct WrapperIo {
    writer: Option<Box<dyn Write + Send>>,
    master: Option<Box<dyn MasterPty + Send>>,
}

struct WrapperHost {
    wrapper_id: String,
    pid: u32,
    cwd: String,
    started_at: u64,
    runtime: Mutex<WrapperRuntime>,
    io: Mutex<WrapperIo>,
}

impl WrapperHost {
    fn summary(&self) -> WrapperSummary {
        let runtime = self.runtime.lock().expect("wrapper runtime lock poisoned");
        WrapperSummary {
            wrapper_id: self.wrapper_id.clone(),
            pid: self.pid,
            cwd: self.cwd.clone(),
            state: runtime.state,
            claude_session_id: runtime.claude_session_id.clone(),
            started_at: self.started_at,
        }
    }
}

/// Registry of supervised wrappers.
pub struct WrapperManager {
    wrappers: DashMap<String, Arc<WrapperHost>>,
    events: broadcast::Sender<WrapperEvent>,
}

impl WrapperManager {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new(Self {
            wrappers: DashMap::new(),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WrapperEvent> {
        self.events.subscribe()
    }

    pub fn list(&self) -> Vec<WrapperSummary> {
        self.wrappers.iter().map(|e| e.value().summary()).collect()
    }

    /// Buffered trailing output, for dashboards that (re)connect mid-stream.
    pub fn history(&self, wrapper_id: &str) -> Result<String, WrapperError> {
        let host = self.host(wrapper_id)?;
        let runtime = host.runtime.lock().expect("wrapper runtime lock poisoned");
        Ok(runtime.history.iter().cloned().collect())
    }

    /// Spawn a new supervised wrapper process on a fresh PTY.
    pub fn spawn_wrapper(
        self: &Arc<Self>,
        args: Vec<String>,
        cwd: String,
        size: TerminalSize,
        prompt: Option<String>,
    ) -> Result<WrapperSummary, WrapperError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: size.rows,
                cols: size.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| WrapperError::Spawn(format!("openpty: {e}")))?;

        let mut argv = args;
        if argv.is_empty() {
            argv.push(DEFAULT_AGENT_COMMAND.to_string());
        }
        let mut cmd = CommandBuilder::new(&argv[0]);
        for arg in &argv[1..] {
            cmd.arg(arg);
        }
        if let Some(ref prompt) = prompt {
            cmd.arg(prompt);
        }
        cmd.cwd(&cwd);
        cmd.env("TERM", "xterm-256color");

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| WrapperError::Spawn(format!("spawn: {e}")))?;
        // The slave side lives on inside the child.
        drop(pair.slave);

        let pid = child.process_id().unwrap_or(0);
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| WrapperError::Spawn(format!("pty writer: {e}")))?;
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| WrapperError::Spawn(format!("pty reader: {e}")))?;

        let wrapper_id = new_wrapper_id();
        let initial_state = if prompt.is_some() {
            WrapperState::Processing
        } else {
            WrapperState::Starting
        };
        let host = Arc::new(WrapperHost {
            wrapper_id: wrapper_id.clone(),
            pid,
            cwd,
            started_at: now_ms(),
            runtime: Mutex::new(WrapperRuntime {
                state: initial_state,
                claude_session_id: None,
                detector: PromptDetector::new(),
                history: VecDeque::new(),
                history_bytes: 0,
            }),
            io: Mutex::new(WrapperIo {
                writer: Some(writer),
                master: Some(pair.master),
            }),
        });
        self.wrappers.insert(wrapper_id.clone(), host.clone());

        // Reader thread bridges blocking PTY reads into the async side.
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<Bytes>(OUTPUT_CHUNK_BUFFER);
        {
            let wrapper_id = wrapper_id.clone();
            std::thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if chunk_tx
                                .blocking_send(Bytes::copy_from_slice(&buf[..n]))
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            debug!(wrapper_id = %wrapper_id, error = %e, "PTY read ended");
                            break;
                        }
                    }
                }
            });
        }
        {
            let manager = Arc::clone(self);
            let wrapper_id = wrapper_id.clone();
            tokio::spawn(async move {
                while let Some(chunk) = chunk_rx.recv().await {
                    manager.handle_output(&wrapper_id, &chunk);
                }
            });
        }

        // Exit watcher owns the child handle.
        {
            let manager = Arc::clone(self);
            let wrapper_id = wrapper_id.clone();
            tokio::spawn(async move {
                let status =
                    tokio::task::spawn_blocking(move || child.wait()).await;
                let exit_code = match status {
                    Ok(Ok(status)) => Some(status.exit_code() as i32),
                    Ok(Err(e)) => {
                        warn!(wrapper_id = %wrapper_id, error = %e, "wait() failed");
                        None
                    }
                    Err(e) => {
                        warn!(wrapper_id = %wrapper_id, error = %e, "exit watcher panicked");
                        None
                    }
                };
                manager.handle_exit(&wrapper_id, exit_code);
            });
        }

        // Without a prompt argument the wrapper settles into waiting_input.
        if prompt.is_none() {
            let manager = Arc::clone(self);
            let wrapper_id = wrapper_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SETTLE_DELAY).await;
                manager.settle(&wrapper_id);
            });
        }

        let summary = host.summary();
        info!(
            wrapper_id = %wrapper_id,
            pid,
            state = ?summary.state,
            "Wrapper spawned"
        );
        self.emit(WrapperEvent::Started {
            wrapper: summary.clone(),
        });
        Ok(summary)
    }

    /// Attach an externally started wrapper. State is tracked from reports
    /// and the process signalled by pid, but there is no PTY to write to.
    pub fn register_external(
        self: &Arc<Self>,
        wrapper_id: String,
        pid: u32,
        cwd: String,
        tty: Option<String>,
    ) -> WrapperSummary {
        let host = Arc::new(WrapperHost {
            wrapper_id: wrapper_id.clone(),
            pid,
            cwd,
            started_at: now_ms(),
            runtime: Mutex::new(WrapperRuntime {
                state: WrapperState::Starting,
                claude_session_id: None,
                detector: PromptDetector::new(),
                history: VecDeque::new(),
                history_bytes: 0,
            }),
            io: Mutex::new(WrapperIo {
                writer: None,
                master: None,
            }),
        });
        self.wrappers.insert(wrapper_id.clone(), host.clone());

        info!(
            wrapper_id = %wrapper_id,
            pid,
            tty = tty.as_deref().unwrap_or("-"),
            "External wrapper registered"
        );

        {
            let manager = Arc::clone(self);
            let wrapper_id = wrapper_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(SETTLE_DELAY).await;
                manager.settle(&wrapper_id);
            });
        }

        let summary = host.summary();
        self.emit(WrapperEvent::Started {
            wrapper: summary.clone(),
        });
        summary
    }

    /// Write remote input to the wrapper. Honored only while waiting_input;
    /// any other state rejects the request without touching the process.
    pub fn inject_input(&self, wrapper_id: &str, input: &str) -> Result<(), WrapperError> {
        let host = self.host(wrapper_id)?;

        {
            let runtime = host.runtime.lock().expect("wrapper runtime lock poisoned");
            if runtime.state != WrapperState::WaitingInput {
                warn!(
                    wrapper_id,
                    state = ?runtime.state,
                    "Input injection rejected: wrapper is not waiting for input"
                );
                return Err(WrapperError::InputRejected {
                    wrapper_id: wrapper_id.to_string(),
                    state: runtime.state,
                });
            }
        }

        {
            let mut io = host.io.lock().expect("wrapper io lock poisoned");
            let writer = io
                .writer
                .as_mut()
                .ok_or_else(|| WrapperError::NoTerminal(wrapper_id.to_string()))?;
            let mut data = input.to_string();
            if !data.ends_with('\n') {
                data.push('\n');
            }
            writer
                .write_all(data.as_bytes())
                .and_then(|_| writer.flush())
                .map_err(|e| WrapperError::Io(format!("pty write: {e}")))?;
        }

        {
            let mut runtime = host.runtime.lock().expect("wrapper runtime lock poisoned");
            runtime.state = WrapperState::Processing;
            runtime.detector.reset();
        }
        self.emit(WrapperEvent::StateChanged {
            wrapper_id: wrapper_id.to_string(),
            state: WrapperState::Processing,
        });
        Ok(())
    }

    /// Explicit state report from a hook or wrapper host.
    pub fn report_state(
        &self,
        wrapper_id: &str,
        state: WrapperState,
        claude_session_id: Option<String>,
    ) -> Result<(), WrapperError> {
        let host = self.host(wrapper_id)?;
        let changed = {
            let mut runtime = host.runtime.lock().expect("wrapper runtime lock poisoned");
            if runtime.state == WrapperState::Ended {
                // Terminal state; late reports change nothing.
                false
            } else {
                if let Some(session_id) = claude_session_id {
                    runtime.claude_session_id = Some(session_id);
                }
                let changed = runtime.state != state;
                runtime.state = state;
                if changed {
                    runtime.detector.reset();
                }
                changed
            }
        };
        if changed {
            self.emit(WrapperEvent::StateChanged {
                wrapper_id: wrapper_id.to_string(),
                state,
            });
        }
        Ok(())
    }

    /// Forward new terminal dimensions to the pseudo-terminal.
    pub fn resize(&self, wrapper_id: &str, cols: u16, rows: u16) -> Result<(), WrapperError> {
        let host = self.host(wrapper_id)?;
        let io = host.io.lock().expect("wrapper io lock poisoned");
        let master = io
            .master
            .as_ref()
            .ok_or_else(|| WrapperError::NoTerminal(wrapper_id.to_string()))?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| WrapperError::Io(format!("resize: {e}")))
    }

    /// Terminate one wrapper: graceful SIGTERM first. The exit watcher
    /// observes the actual exit and emits the terminal transition.
    pub fn kill(&self, wrapper_id: &str) -> Result<(), WrapperError> {
        let host = self.host(wrapper_id)?;
        if host.pid == 0 {
            return Err(WrapperError::NoTerminal(wrapper_id.to_string()));
        }
        info!(wrapper_id, pid = host.pid, "Sending SIGTERM to wrapper");
        unsafe {
            libc::kill(host.pid as libc::pid_t, libc::SIGTERM);
        }
        // Externally registered wrappers have no exit watcher; close them out
        // here so observers still see the terminal transition.
        let external = {
            let io = host.io.lock().expect("wrapper io lock poisoned");
            io.master.is_none()
        };
        if external {
            self.handle_exit(wrapper_id, None);
        }
        Ok(())
    }

    // -- Internal transitions ----------------------------------------------

    fn handle_output(&self, wrapper_id: &str, chunk: &[u8]) {
        let Ok(host) = self.host(wrapper_id) else {
            return;
        };
        let text = String::from_utf8_lossy(chunk).to_string();

        let became_waiting = {
            let mut runtime = host.runtime.lock().expect("wrapper runtime lock poisoned");
            runtime.history_bytes += text.len();
            runtime.history.push_back(text.clone());
            while runtime.history_bytes > OUTPUT_HISTORY_BYTES {
                match runtime.history.pop_front() {
                    Some(old) => runtime.history_bytes -= old.len(),
                    None => break,
                }
            }

            runtime.detector.feed(&text);
            // The heuristic only fires while processing; that keeps the
            // state from flapping on prompt-shaped output elsewhere.
            if runtime.state == WrapperState::Processing
                && runtime.detector.looks_like_waiting()
            {
                runtime.state = WrapperState::WaitingInput;
                true
            } else {
                false
            }
        };

        self.emit(WrapperEvent::Output {
            wrapper_id: wrapper_id.to_string(),
            data: text,
        });
        if became_waiting {
            self.emit(WrapperEvent::StateChanged {
                wrapper_id: wrapper_id.to_string(),
                state: WrapperState::WaitingInput,
            });
        }
    }

    fn settle(&self, wrapper_id: &str) {
        let Ok(host) = self.host(wrapper_id) else {
            return;
        };
        let settled = {
            let mut runtime = host.runtime.lock().expect("wrapper runtime lock poisoned");
            if runtime.state == WrapperState::Starting {
                runtime.state = WrapperState::WaitingInput;
                true
            } else {
                false
            }
        };
        if settled {
            self.emit(WrapperEvent::StateChanged {
                wrapper_id: wrapper_id.to_string(),
                state: WrapperState::WaitingInput,
            });
        }
    }

    fn handle_exit(&self, wrapper_id: &str, exit_code: Option<i32>) {
        let Some((_, host)) = self.wrappers.remove(wrapper_id) else {
            return;
        };
        {
            let mut runtime = host.runtime.lock().expect("wrapper runtime lock poisoned");
            runtime.state = WrapperState::Ended;
        }
        info!(wrapper_id, exit_code = ?exit_code, "Wrapper ended");
        self.emit(WrapperEvent::StateChanged {
            wrapper_id: wrapper_id.to_string(),
            state: WrapperState::Ended,
        });
        self.emit(WrapperEvent::Ended {
            wrapper_id: wrapper_id.to_string(),
            exit_code,
        });
    }

    fn host(&self, wrapper_id: &str) -> Result<Arc<WrapperHost>, WrapperError> {
        self.wrappers
            .get(wrapper_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| WrapperError::NotFound(wrapper_id.to_string()))
    }

    fn emit(&self, event: WrapperEvent) {
        let _ = self.events.send(event);
    }
}

fn new_wrapper_id() -> String {
    let full = uuid::Uuid::new_v4().simple().to_string();
    format!("wrap-{}", &full[..8])
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
