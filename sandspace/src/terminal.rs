//! Interactive terminal sessions.
//!
//! A [`TerminalBridge`] pairs one client channel (a WebSocket in production)
//! with one TTY process inside a space and pumps bytes both ways until either
//! side goes away.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use sandspace_protocol::{ClientMessage, ServerMessage, DEFAULT_TERMINAL_COLS, DEFAULT_TERMINAL_ROWS};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::audit::AuditKind;
use crate::error::SpaceError;
use crate::runtime::{ExecSpec, InputSink};
use crate::space::SpaceManager;

/// Prefer bash when the image has it.
const LOGIN_SHELL: &str = "if command -v bash >/dev/null 2>&1; then exec bash -l; else exec sh -l; fi";

/// Client input chunks queued ahead of the stdin writer.
const INPUT_QUEUE: usize = 64;

/// How long teardown waits for queued input to reach the process.
const STDIN_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Connecting,
    Attached,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_TERMINAL_COLS,
            rows: DEFAULT_TERMINAL_ROWS,
        }
    }
}

impl TerminalSize {
    /// Size from optional query values; zero or missing falls back to 80x24.
    pub fn from_query(cols: Option<u16>, rows: Option<u16>) -> Self {
        let default = Self::default();
        Self {
            cols: cols.filter(|c| *c > 0).unwrap_or(default.cols),
            rows: rows.filter(|r| *r > 0).unwrap_or(default.rows),
        }
    }
}

/// A message received from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Binary(Bytes),
    /// Transport-level keepalive.
    Ping,
    Close,
}

/// A message for the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
}

/// The client side of a terminal session.
#[async_trait]
pub trait TerminalChannel: Send {
    /// Next client message. `None` once the channel is gone.
    async fn recv(&mut self) -> Option<Inbound>;
    /// Returns false when the client can no longer be reached.
    async fn send(&mut self, msg: Outbound) -> bool;
    async fn close(&mut self);
}

/// Outcome of a finished session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub state: BridgeState,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// What a single client message asks the bridge to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Action {
    Write(Bytes),
    Resize(TerminalSize),
    Pong,
    Nothing,
    Close,
}

/// Interpret a client message. Binary and non-JSON text are raw input.
pub(crate) fn interpret(msg: Inbound) -> Action {
    match msg {
        Inbound::Binary(bytes) => Action::Write(bytes),
        Inbound::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Input(data)) => Action::Write(Bytes::from(data)),
            Ok(ClientMessage::Resize { cols, rows }) if cols > 0 && rows > 0 => {
                Action::Resize(TerminalSize { cols, rows })
            }
            Ok(ClientMessage::Resize { .. }) => Action::Nothing,
            Ok(ClientMessage::Ping(_)) => Action::Pong,
            Err(_) => Action::Write(Bytes::from(text)),
        },
        Inbound::Ping => Action::Nothing,
        Inbound::Close => Action::Close,
    }
}

struct Session<C: TerminalChannel> {
    space: String,
    channel: C,
    input: Option<mpsc::Sender<Bytes>>,
    writer: Option<JoinHandle<()>>,
    state: BridgeState,
    bytes_in: u64,
    bytes_out: u64,
}

impl<C: TerminalChannel> Session<C> {
    /// Close both ends. Safe to call more than once.
    async fn teardown(&mut self) {
        if matches!(self.state, BridgeState::Closing | BridgeState::Closed) {
            return;
        }
        self.state = BridgeState::Closing;
        // Closing the queue lets the writer flush and shut stdin down.
        self.input.take();
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(STDIN_DRAIN, &mut writer).await.is_err() {
                debug!(space = %self.space, "terminal stdin blocked, dropping queued input");
                writer.abort();
            }
        }
        self.channel.close().await;
        self.state = BridgeState::Closed;
        debug!(space = %self.space, "terminal session torn down");
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            state: self.state,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
        }
    }
}

/// Copy queued client input into the process stdin. Runs apart from the
/// output pump so a process that stops reading stdin cannot stall its output.
async fn pump_input(space: String, mut input: InputSink, mut queue: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = queue.recv().await {
        if let Err(e) = input.write_all(&bytes).await {
            debug!(space = %space, error = %e, "terminal stdin closed");
            return;
        }
        if let Err(e) = input.flush().await {
            debug!(space = %space, error = %e, "terminal stdin closed");
            return;
        }
    }
    // Already-closed stdin is fine.
    let _ = input.shutdown().await;
}

async fn reserve_input(input: Option<&mpsc::Sender<Bytes>>) -> Option<mpsc::Permit<'_, Bytes>> {
    input?.reserve().await.ok()
}

#[derive(Clone)]
pub struct TerminalBridge {
    manager: Arc<SpaceManager>,
}

impl TerminalBridge {
    pub fn new(manager: Arc<SpaceManager>) -> Self {
        Self { manager }
    }

    /// Run one session to completion.
    #[instrument(skip(self, channel), fields(space = %space))]
    pub async fn run<C: TerminalChannel>(
        &self,
        space: &str,
        size: TerminalSize,
        channel: C,
    ) -> SessionSummary {
        let mut session = Session {
            space: space.to_string(),
            channel,
            input: None,
            writer: None,
            state: BridgeState::Connecting,
            bytes_in: 0,
            bytes_out: 0,
        };

        let info = match self.manager.ensure_running(space).await {
            Ok(info) => info,
            Err(e) => {
                debug!(space = %space, error = %e, "terminal attach refused");
                session.teardown().await;
                return session.summary();
            }
        };

        let rt = &self.manager.config().runtime;
        let spec = ExecSpec {
            argv: vec!["sh".into(), "-c".into(), LOGIN_SHELL.into()],
            user: Some(rt.user.clone()),
            working_dir: Some(rt.workspace_mount.clone()),
            env: vec!["TERM=xterm-256color".into()],
            tty: true,
            stdin: true,
        };
        let runtime = self.manager.runtime();
        let exec = match runtime.exec_interactive(&info.name, &spec).await {
            Ok(exec) => exec,
            Err(e) => {
                warn!(space = %space, error = %e, "failed to start terminal process");
                let msg = ServerMessage::Error {
                    message: SpaceError::runtime(space, e).to_string(),
                };
                if let Ok(text) = serde_json::to_string(&msg) {
                    session.channel.send(Outbound::Text(text)).await;
                }
                session.teardown().await;
                return session.summary();
            }
        };
        let exec_id = exec.exec_id;
        let mut output = exec.output;
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        session.input = Some(input_tx);
        session.writer = Some(tokio::spawn(pump_input(
            space.to_string(),
            exec.input,
            input_rx,
        )));

        if let Err(e) = runtime.resize_exec(&exec_id, size.cols, size.rows).await {
            warn!(space = %space, error = %e, "initial terminal resize failed");
        }

        session.state = BridgeState::Attached;
        let started = Instant::now();
        self.manager.activity().touch(space);
        self.manager.metrics().terminal_opened();
        self.manager.audit().record(
            AuditKind::TerminalOpen,
            space,
            json!({ "cols": size.cols, "rows": size.rows }),
        );
        info!(space = %space, cols = size.cols, rows = size.rows, "terminal attached");

        // Input waiting for queue space. The client is not read meanwhile.
        let mut pending: Option<Bytes> = None;
        loop {
            tokio::select! {
                chunk = output.next() => match chunk {
                    Some(Ok(bytes)) => {
                        session.bytes_out += bytes.len() as u64;
                        if !session.channel.send(Outbound::Binary(bytes)).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(space = %space, error = %e, "terminal output stream failed");
                        break;
                    }
                    None => {
                        debug!(space = %space, "terminal process exited");
                        break;
                    }
                },
                permit = reserve_input(session.input.as_ref()), if pending.is_some() => {
                    let Some(permit) = permit else {
                        debug!(space = %space, "terminal stdin writer stopped");
                        break;
                    };
                    if let Some(bytes) = pending.take() {
                        permit.send(bytes);
                    }
                },
                msg = session.channel.recv(), if pending.is_none() => {
                    let Some(msg) = msg else { break };
                    self.manager.activity().touch(space);
                    match interpret(msg) {
                        Action::Write(bytes) => {
                            session.bytes_in += bytes.len() as u64;
                            pending = Some(bytes);
                        }
                        Action::Resize(size) => {
                            if let Err(e) = runtime.resize_exec(&exec_id, size.cols, size.rows).await {
                                warn!(space = %space, error = %e, "terminal resize failed");
                            }
                        }
                        Action::Pong => {
                            if let Ok(text) = serde_json::to_string(&ServerMessage::Pong {}) {
                                if !session.channel.send(Outbound::Text(text)).await {
                                    break;
                                }
                            }
                        }
                        Action::Nothing => {}
                        Action::Close => break,
                    }
                }
            }
        }

        session.teardown().await;
        self.manager.metrics().terminal_closed();
        self.manager.audit().record(
            AuditKind::TerminalClose,
            space,
            json!({
                "duration_ms": started.elapsed().as_millis() as u64,
                "bytes_in": session.bytes_in,
                "bytes_out": session.bytes_out,
            }),
        );
        info!(space = %space, "terminal closed");
        session.summary()
    }
}
