use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use russh::client::{self, Handle};
use russh::keys::ssh_key::PublicKey;
use russh::keys::PrivateKeyWithHashAlg;
use russh::{ChannelMsg, Disconnect, Pty};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::host_key::HostKeyPolicy;
use crate::key_manager::load_private_key;

pub const PTY_TERM: &str = "xterm";
pub const PTY_COLS: u32 = 80;
pub const PTY_ROWS: u32 = 40;
const PTY_MODES: [(Pty, u32); 3] = [
    (Pty::ECHO, 1),
    (Pty::TTY_OP_ISPEED, 14400),
    (Pty::TTY_OP_OSPEED, 14400),
];

/// Extended data stream number for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

// stdin 读线程最多缓存的数据块数
const STDIN_QUEUE: usize = 16;

/// Everything needed to dial and authenticate.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
    /// 只限制连接、握手和认证阶段，之后不再计时
    pub timeout: Duration,
    pub host_key_policy: HostKeyPolicy,
}

/// Why a session ended without an exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// 远端进程被信号终止
    Signal(String),
    /// 通道关闭时没有上报任何退出状态
    NoExitStatus,
}

/// How a remote command or shell finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    Success,
    ExitCode(u32),
    SessionError(SessionErrorKind),
}

impl RemoteOutcome {
    fn from_parts(status: Option<u32>, signal: Option<String>) -> Self {
        match (status, signal) {
            (Some(0), _) => RemoteOutcome::Success,
            (Some(code), _) => RemoteOutcome::ExitCode(code),
            (None, Some(signal)) => RemoteOutcome::SessionError(SessionErrorKind::Signal(signal)),
            (None, None) => RemoteOutcome::SessionError(SessionErrorKind::NoExitStatus),
        }
    }

    /// Local process exit code mirroring this outcome.
    pub fn exit_code(&self) -> i32 {
        match self {
            RemoteOutcome::Success => 0,
            RemoteOutcome::ExitCode(code) => i32::try_from(*code).unwrap_or(1),
            RemoteOutcome::SessionError(_) => 1,
        }
    }
}

struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(self.policy.check(&self.host, self.port, server_public_key))
    }
}

/// An authenticated connection to a server.
pub struct ClientSession {
    handle: Handle<ClientHandler>,
    user: String,
}

impl ClientSession {
    /// Load the key, dial, verify the host key and authenticate.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let key = load_private_key(&config.key_path)?;
        debug!(key = %config.key_path.display(), "private key loaded");

        let timeout = config.timeout;
        match tokio::time::timeout(timeout, Self::dial(config, key)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }

    async fn dial(config: ClientConfig, key: russh::keys::PrivateKey) -> Result<Self, ClientError> {
        let handler = ClientHandler {
            host: config.host.clone(),
            port: config.port,
            policy: config.host_key_policy.clone(),
        };

        info!("connecting to {}:{} as {}", config.host, config.port, config.user);
        let mut handle = client::connect(
            Arc::new(client::Config::default()),
            (config.host.as_str(), config.port),
            handler,
        )
        .await
        .map_err(|e| match e {
            russh::Error::UnknownKey => ClientError::HostKeyRejected {
                host: format!("{}:{}", config.host, config.port),
            },
            other => ClientError::Dial(other.to_string()),
        })?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(|e| ClientError::Session(e.to_string()))?
            .flatten();
        let auth = handle
            .authenticate_publickey(
                config.user.clone(),
                PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
            )
            .await
            .map_err(|e| ClientError::Session(e.to_string()))?;

        if !auth.success() {
            return Err(ClientError::Authentication { user: config.user });
        }
        info!(user = %config.user, "authenticated");

        Ok(Self {
            handle,
            user: config.user,
        })
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Run one command and stream its output.
    pub async fn run<O, E>(
        &self,
        command: &str,
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<RemoteOutcome, ClientError>
    where
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ClientError::Session(e.to_string()))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| ClientError::Exec(e.to_string()))?;
        debug!(command, "exec requested");

        let mut status = None;
        let mut signal = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => {
                    stdout.write_all(data).await.map_err(|e| ClientError::Exec(e.to_string()))?;
                }
                ChannelMsg::ExtendedData { ref data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                    stderr.write_all(data).await.map_err(|e| ClientError::Exec(e.to_string()))?;
                }
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => signal = Some(format!("{:?}", signal_name)),
                ChannelMsg::Failure => {
                    return Err(ClientError::Exec("server refused the exec request".to_string()));
                }
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        stdout.flush().await.map_err(|e| ClientError::Exec(e.to_string()))?;
        stderr.flush().await.map_err(|e| ClientError::Exec(e.to_string()))?;
        Ok(RemoteOutcome::from_parts(status, signal))
    }

    /// Request a pty and a shell, then pump stdin to the channel and channel
    /// output to stdout/stderr until the remote side ends the session.
    pub async fn shell<I, O, E>(
        &self,
        stdin: I,
        stdout: &mut O,
        stderr: &mut E,
    ) -> Result<RemoteOutcome, ClientError>
    where
        I: AsyncRead + Unpin + Send + 'static,
        O: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        let channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| ClientError::Session(e.to_string()))?;
        channel
            .request_pty(true, PTY_TERM, PTY_COLS, PTY_ROWS, 0, 0, &PTY_MODES)
            .await
            .map_err(|e| ClientError::Shell(e.to_string()))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| ClientError::Shell(e.to_string()))?;
        debug!("pty and shell requested");

        let (mut reader, writer) = channel.split();

        let pump = tokio::spawn(async move {
            let mut stdin = stdin;
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) => {
                        let _ = writer.eof().await;
                        break;
                    }
                    Ok(n) => {
                        if writer.data(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("reading stdin failed: {}", e);
                        let _ = writer.eof().await;
                        break;
                    }
                }
            }
        });

        let mut status = None;
        let mut signal = None;
        let result = async {
            while let Some(msg) = reader.wait().await {
                match msg {
                    ChannelMsg::Data { ref data } => {
                        stdout.write_all(data).await?;
                        stdout.flush().await?;
                    }
                    ChannelMsg::ExtendedData { ref data, ext } if ext == SSH_EXTENDED_DATA_STDERR => {
                        stderr.write_all(data).await?;
                        stderr.flush().await?;
                    }
                    ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
                    ChannelMsg::ExitSignal { signal_name, .. } => {
                        signal = Some(format!("{:?}", signal_name))
                    }
                    ChannelMsg::Failure => {
                        return Err(std::io::Error::other("server refused the pty or shell request"));
                    }
                    ChannelMsg::Close => break,
                    _ => {}
                }
            }
            Ok(())
        }
        .await;
        pump.abort();

        result.map_err(|e| ClientError::Shell(e.to_string()))?;
        Ok(RemoteOutcome::from_parts(status, signal))
    }

    pub async fn close(self) -> Result<(), ClientError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| ClientError::Session(e.to_string()))
    }
}

/// Process stdin read on a dedicated OS thread.
///
/// `tokio::io::stdin` reads on the runtime's blocking pool, and a read that
/// is already in progress cannot be cancelled, so runtime shutdown would wait
/// for the next keypress. Here the blocking read lives on a plain thread that
/// nothing waits for; the async side only sees a queue.
pub struct ThreadedStdin {
    // 读线程发送的数据块，线程退出时队列关闭
    chunks: mpsc::Receiver<std::io::Result<Bytes>>,
    // 上一个数据块中尚未交给调用者的部分
    pending: Bytes,
}

impl ThreadedStdin {
    pub fn spawn() -> std::io::Result<Self> {
        Self::from_reader(std::io::stdin())
    }

    /// Read `reader` on its own thread. Only the thread blocks on it.
    pub fn from_reader<R>(mut reader: R) -> std::io::Result<Self>
    where
        R: std::io::Read + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(STDIN_QUEUE);
        std::thread::Builder::new()
            .name("sshkit-stdin".to_string())
            .spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            // 接收端已关闭，会话结束
                            if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            let _ = tx.blocking_send(Err(e));
                            break;
                        }
                    }
                }
            })?;

        Ok(Self {
            chunks: rx,
            pending: Bytes::new(),
        })
    }
}

impl AsyncRead for ThreadedStdin {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pending.is_empty() {
            match ready!(self.chunks.poll_recv(cx)) {
                Some(Ok(chunk)) => self.pending = chunk,
                Some(Err(e)) => return Poll::Ready(Err(e)),
                // 读线程结束即 EOF
                None => return Poll::Ready(Ok(())),
            }
        }

        let n = buf.remaining().min(self.pending.len());
        let chunk = self.pending.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

/// Puts the local terminal into raw mode and restores it on drop.
#[cfg(unix)]
pub struct RawModeGuard {
    original: nix::sys::termios::Termios,
}

#[cfg(unix)]
impl RawModeGuard {
    /// Returns `None` when stdin is not a terminal.
    pub fn enable() -> nix::Result<Option<Self>> {
        use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
        use std::io::IsTerminal;

        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return Ok(None);
        }

        let original = tcgetattr(&stdin)?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&stdin, SetArg::TCSANOW, &raw)?;
        Ok(Some(Self { original }))
    }
}

#[cfg(unix)]
impl Drop for RawModeGuard {
    fn drop(&mut self) {
        use nix::sys::termios::{tcsetattr, SetArg};
        if let Err(e) = tcsetattr(std::io::stdin(), SetArg::TCSANOW, &self.original) {
            warn!("failed to restore terminal mode: {}", e);
        }
    }
}
