//! Per-channel request state machine and the task that carries out its effects.
//!
//! russh delivers requests to the connection handler one at a time. The
//! handler asks [`ChannelState`] what to do, replies to the peer right away,
//! and forwards the resulting [`ChannelEvent`] to the channel's
//! [`ChannelWorker`]. The worker is the only code that writes to the channel.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn, Instrument};

use crate::command_handler::{ChannelCommunicator, CommandTable, STATUS_SUCCESS};
use crate::error::ProtocolError;
use crate::terminal::{InteractiveTerminal, TerminalExit};
use crate::try_log;

/// Terminal parameters from a `pty-req`. Recorded, not enforced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
}

/// A channel request as seen by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRequest {
    /// Raw command bytes as carried by the request
    Exec(Vec<u8>),
    Shell,
    PtyReq(PtyRequest),
    /// Anything else (`env`, `subsystem`, `x11-req`, `window-change`, ...)
    Other(&'static str),
}

impl ChannelRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelRequest::Exec(_) => "exec",
            ChannelRequest::Shell => "shell",
            ChannelRequest::PtyReq(_) => "pty-req",
            ChannelRequest::Other(kind) => *kind,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// No request accepted yet
    #[default]
    Fresh,
    /// `shell` acknowledged, still waiting for a `pty-req`
    ShellAcknowledged,
    /// A terminal is attached
    Interactive,
    /// A one-shot command was accepted; the channel is about to close
    Exec,
}

impl ChannelMode {
    fn name(self) -> &'static str {
        match self {
            ChannelMode::Fresh => "fresh",
            ChannelMode::ShellAcknowledged => "shell",
            ChannelMode::Interactive => "interactive",
            ChannelMode::Exec => "exec",
        }
    }
}

/// Work handed from the connection handler to the channel worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Exec(String),
    StartTerminal(PtyRequest),
    Input(Bytes),
    Eof,
}

/// Outcome of a request that was not a protocol error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Reply success, then hand the event (if any) to the worker
    Accept(Option<ChannelEvent>),
    /// Reply failure; the channel stays open
    Reject,
}

#[derive(Debug, Default)]
pub struct ChannelState {
    mode: ChannelMode,
}

impl ChannelState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode
    }

    pub fn handle(&mut self, request: ChannelRequest) -> Result<Disposition, ProtocolError> {
        use ChannelMode::*;

        match (self.mode, request) {
            (Fresh, ChannelRequest::Exec(payload)) => {
                let command = decode_command(&payload)?;
                self.mode = Exec;
                Ok(Disposition::Accept(Some(ChannelEvent::Exec(command))))
            }
            (Fresh, ChannelRequest::Shell) => {
                self.mode = ShellAcknowledged;
                Ok(Disposition::Accept(None))
            }
            // the usual client order is pty-req then shell
            (Interactive, ChannelRequest::Shell) => Ok(Disposition::Accept(None)),
            (Fresh | ShellAcknowledged, ChannelRequest::PtyReq(pty)) => {
                self.mode = Interactive;
                Ok(Disposition::Accept(Some(ChannelEvent::StartTerminal(pty))))
            }
            (_, ChannelRequest::Other(_)) => Ok(Disposition::Reject),
            (mode, request) => Err(ProtocolError::ModeConflict {
                request: request.kind(),
                mode: mode.name(),
            }),
        }
    }
}

/// Validate the command carried by an `exec` request.
///
/// The transport has already removed the length prefix; what is left must be
/// a non-empty UTF-8 string without NUL bytes.
pub fn decode_command(payload: &[u8]) -> Result<String, ProtocolError> {
    if payload.is_empty() {
        return Err(ProtocolError::EmptyCommand);
    }
    if payload.contains(&0) {
        return Err(ProtocolError::EmbeddedNul);
    }
    String::from_utf8(payload.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

/// Owns all output for one session channel.
pub struct ChannelWorker {
    user: String,
    commands: Arc<CommandTable>,
    out: Arc<dyn ChannelCommunicator>,
}

impl ChannelWorker {
    pub fn new(
        user: impl Into<String>,
        commands: Arc<CommandTable>,
        out: Arc<dyn ChannelCommunicator>,
    ) -> Self {
        Self {
            user: user.into(),
            commands,
            out,
        }
    }

    /// Start the worker task and return the queue that feeds it.
    ///
    /// The queue is unbounded: the connection handler must never wait on a
    /// worker that is itself waiting on the connection to flush output. The
    /// task runs inside the caller's current span.
    pub fn spawn(self) -> (UnboundedSender<ChannelEvent>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx).in_current_span());
        (tx, task)
    }

    pub async fn run(self, mut events: UnboundedReceiver<ChannelEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Exec(command) => {
                    let _ = try_log!(self.exec(&command).await, warn, "exec failed");
                    return;
                }
                ChannelEvent::StartTerminal(pty) => {
                    debug!(term = %pty.term, cols = pty.cols, rows = pty.rows, "attaching terminal");
                    let mut terminal = InteractiveTerminal::new(
                        self.user.clone(),
                        self.commands.clone(),
                        self.out.clone(),
                    );
                    let exit = terminal.run(&mut events).await;
                    self.finish_terminal(exit).await;
                    return;
                }
                ChannelEvent::Input(bytes) => {
                    trace!(len = bytes.len(), "input before any terminal, dropped");
                }
                ChannelEvent::Eof => {
                    debug!("peer sent EOF");
                }
            }
        }
        debug!("channel worker finished");
    }

    async fn exec(&self, command: &str) -> anyhow::Result<()> {
        let outcome = self.commands.execute(&self.user, command);
        info!(user = %self.user, command, found = outcome.found(), status = outcome.status, "exec");

        self.out.send_data(outcome.output.as_bytes()).await?;
        self.close_with_status(outcome.status).await
    }

    async fn close_with_status(&self, status: u32) -> anyhow::Result<()> {
        self.out.send_exit_status(status).await?;
        self.out.send_eof().await?;
        self.out.close_channel().await
    }

    async fn finish_terminal(&self, exit: TerminalExit) {
        match exit {
            TerminalExit::Quit => {
                let _ = try_log!(
                    self.close_with_status(STATUS_SUCCESS).await,
                    warn,
                    "closing channel after quit failed"
                );
            }
            TerminalExit::EndOfInput => {
                // the peer may already be gone
                let _ = self.out.send_exit_status(STATUS_SUCCESS).await;
                let _ = self.out.close_channel().await;
            }
            TerminalExit::Failed => {
                warn!("terminal stopped after a write failure");
            }
        }
    }
}
