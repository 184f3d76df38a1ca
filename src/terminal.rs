//! Line-oriented REPL for channels that asked for a pty.
//!
//! The client's terminal is in raw mode, so the server does the line
//! discipline itself: echo, erase, line endings and Ctrl-C / Ctrl-D.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info};

use crate::channel::ChannelEvent;
use crate::command_handler::{ChannelCommunicator, CommandTable};

pub const PROMPT: &str = "> ";
const MAX_LINE: usize = 4096;

const CTRL_C: u8 = 0x03;
const CTRL_D: u8 = 0x04;
const BACKSPACE: u8 = 0x08;
const ESC: u8 = 0x1b;
const DEL: u8 = 0x7f;

/// One thing the editor wants the terminal to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Bytes to echo back verbatim
    Echo(Vec<u8>),
    /// A completed line, without its terminator
    Line(String),
    /// Ctrl-C: the pending line was discarded
    Cancel,
    /// Ctrl-D on an empty line
    EndOfInput,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Escape {
    #[default]
    Ground,
    Start,
    Csi,
    Ss3,
}

/// Incremental line editor fed with raw channel bytes.
#[derive(Debug, Default)]
pub struct LineEditor {
    line: Vec<u8>,
    escape: Escape,
    after_cr: bool,
}

impl LineEditor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, input: &[u8]) -> Vec<Edit> {
        let mut edits = Vec::new();
        let mut echo = Vec::new();

        for &byte in input {
            let after_cr = std::mem::take(&mut self.after_cr);

            match self.escape {
                Escape::Start => {
                    self.escape = match byte {
                        b'[' => Escape::Csi,
                        b'O' => Escape::Ss3,
                        _ => Escape::Ground,
                    };
                    continue;
                }
                Escape::Csi => {
                    if (0x40..=0x7e).contains(&byte) {
                        self.escape = Escape::Ground;
                    }
                    continue;
                }
                Escape::Ss3 => {
                    self.escape = Escape::Ground;
                    continue;
                }
                Escape::Ground => {}
            }

            match byte {
                b'\n' if after_cr => {}
                b'\r' | b'\n' => {
                    self.after_cr = byte == b'\r';
                    echo.extend_from_slice(b"\r\n");
                    flush(&mut echo, &mut edits);
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    self.line.clear();
                    edits.push(Edit::Line(line));
                }
                DEL | BACKSPACE => {
                    if self.erase_char() {
                        echo.extend_from_slice(b"\x08 \x08");
                    }
                }
                CTRL_C => {
                    self.line.clear();
                    echo.extend_from_slice(b"^C\r\n");
                    flush(&mut echo, &mut edits);
                    edits.push(Edit::Cancel);
                }
                CTRL_D => {
                    if self.line.is_empty() {
                        flush(&mut echo, &mut edits);
                        edits.push(Edit::EndOfInput);
                    }
                }
                ESC => self.escape = Escape::Start,
                b if b < 0x20 => {}
                b => {
                    if self.line.len() < MAX_LINE {
                        self.line.push(b);
                        echo.push(b);
                    }
                }
            }
        }

        flush(&mut echo, &mut edits);
        edits
    }

    /// Drop the last UTF-8 character of the pending line.
    fn erase_char(&mut self) -> bool {
        if self.line.is_empty() {
            return false;
        }
        while let Some(byte) = self.line.pop() {
            if byte & 0b1100_0000 != 0b1000_0000 {
                break;
            }
        }
        true
    }
}

fn flush(echo: &mut Vec<u8>, edits: &mut Vec<Edit>) {
    if !echo.is_empty() {
        edits.push(Edit::Echo(std::mem::take(echo)));
    }
}

/// Terminal output uses CRLF line endings.
fn to_crlf(text: &str) -> String {
    text.replace('\n', "\r\n")
}

/// Why the REPL stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalExit {
    /// The user typed `quit`; the channel should be closed
    Quit,
    /// The peer stopped sending (EOF, Ctrl-D or a dropped channel)
    EndOfInput,
    /// Writing to the channel failed
    Failed,
}

pub struct InteractiveTerminal {
    user: String,
    commands: Arc<CommandTable>,
    out: Arc<dyn ChannelCommunicator>,
    editor: LineEditor,
}

impl InteractiveTerminal {
    pub fn new(
        user: impl Into<String>,
        commands: Arc<CommandTable>,
        out: Arc<dyn ChannelCommunicator>,
    ) -> Self {
        Self {
            user: user.into(),
            commands,
            out,
            editor: LineEditor::new(),
        }
    }

    /// Run until quit, end of input or a write failure.
    pub async fn run(&mut self, input: &mut UnboundedReceiver<ChannelEvent>) -> TerminalExit {
        info!(user = %self.user, "interactive terminal started");

        if let Err(e) = self.out.send_data(PROMPT.as_bytes()).await {
            error!("terminal write failed: {:#}", e);
            return TerminalExit::Failed;
        }

        let exit = loop {
            let Some(event) = input.recv().await else {
                break TerminalExit::EndOfInput;
            };
            match event {
                ChannelEvent::Input(bytes) => match self.feed(&bytes).await {
                    Ok(Some(exit)) => break exit,
                    Ok(None) => {}
                    Err(e) => {
                        error!("terminal write failed: {:#}", e);
                        break TerminalExit::Failed;
                    }
                },
                ChannelEvent::Eof => break TerminalExit::EndOfInput,
                other => debug!(?other, "ignored in interactive mode"),
            }
        };

        info!(?exit, "interactive terminal stopped");
        exit
    }

    /// Process one chunk of raw input.
    pub async fn feed(&mut self, bytes: &[u8]) -> Result<Option<TerminalExit>> {
        for edit in self.editor.push(bytes) {
            match edit {
                Edit::Echo(echo) => self.out.send_data(&echo).await?,
                Edit::Cancel => self.out.send_data(PROMPT.as_bytes()).await?,
                Edit::EndOfInput => return Ok(Some(TerminalExit::EndOfInput)),
                Edit::Line(line) => {
                    if let Some(exit) = self.dispatch(&line).await? {
                        return Ok(Some(exit));
                    }
                    self.out.send_data(PROMPT.as_bytes()).await?;
                }
            }
        }
        Ok(None)
    }

    async fn dispatch(&self, line: &str) -> Result<Option<TerminalExit>> {
        debug!(line, "terminal line");

        let reply = match line {
            "" => return Ok(None),
            "quit" => {
                self.write(&to_crlf("Goodbye!\n")).await?;
                return Ok(Some(TerminalExit::Quit));
            }
            cmd if self.commands.contains(cmd) => self.commands.execute(&self.user, cmd).output,
            _ => "Command not found\n".to_string(),
        };

        self.write(&to_crlf(&reply)).await?;
        Ok(None)
    }

    async fn write(&self, text: &str) -> Result<()> {
        self.out.send_data(text.as_bytes()).await
    }
}
