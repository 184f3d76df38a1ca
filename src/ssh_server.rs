use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use russh::keys::ssh_key::{HashAlg, PublicKey};
use russh::server::{Auth, Msg, Server, Session};
use russh::{Channel, ChannelId, MethodKind, MethodSet, Pty};
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::authorized_keys::AuthorizedKeySet;
use crate::channel::{ChannelEvent, ChannelRequest, ChannelState, ChannelWorker, Disposition, PtyRequest};
use crate::command_handler::{CommandTable, SshChannelCommunicator};
use crate::error::{Error, Result};
use crate::key_manager::ServerIdentity;

/// SSH server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 监听地址
    pub bind_address: String,
    /// 监听端口
    pub port: u16,
    /// 允许执行的命令，为空表示全部内置命令
    pub allowed_commands: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 2022,
            allowed_commands: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// 握手成功后的连接身份：用户名和所用公钥的指纹
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedConnection {
    pub user: String,
    pub fingerprint: String,
}

/// Restricted-command SSH server.
///
/// Cloning is cheap; every clone shares the host key, the authorized keys
/// and the command table, all of which are read-only after construction.
#[derive(Clone)]
pub struct SshServer {
    config: ServerConfig,
    russh_config: Arc<russh::server::Config>,
    authorized: Arc<AuthorizedKeySet>,
    commands: Arc<CommandTable>,
    next_id: Arc<AtomicUsize>,
}

impl SshServer {
    pub fn new(
        config: ServerConfig,
        identity: ServerIdentity,
        authorized: AuthorizedKeySet,
    ) -> Result<Self> {
        let commands = CommandTable::with_allowed(&config.allowed_commands)?;

        let mut methods = MethodSet::empty();
        methods.push(MethodKind::PublicKey);

        let russh_config = russh::server::Config {
            methods,
            auth_rejection_time: Duration::from_secs(3),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            keys: vec![identity.key().clone()],
            ..Default::default()
        };

        info!(
            host_key = %identity.fingerprint(),
            authorized_keys = authorized.len(),
            commands = ?commands.names(),
            "server configured"
        );
        if authorized.is_empty() {
            warn!("authorized keys file is empty, nobody will be able to log in");
        }

        Ok(Self {
            config,
            russh_config: Arc::new(russh_config),
            authorized: Arc::new(authorized),
            commands: Arc::new(commands),
            next_id: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&mut self) -> Result<()> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!("listening on {}", addr);
        self.run_on_listener(listener).await
    }

    /// Serve connections from an already bound listener.
    ///
    /// Each connection runs on its own task. A failed handshake or session
    /// only ends that connection; the loop stops only when `accept` itself
    /// fails in a way that is not tied to one connection.
    pub async fn run_on_listener(&mut self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_per_connection(&e) => {
                    warn!("accept failed, continuing: {}", e);
                    continue;
                }
                Err(e) => {
                    error!("listener failed: {}", e);
                    return Err(Error::Listener(e));
                }
            };

            let handler = self.new_client(Some(peer));
            let conn = handler.id;
            let config = self.russh_config.clone();
            info!(conn, %peer, "connection accepted");

            tokio::spawn(
                async move {
                    let session = match russh::server::run_stream(config, stream, handler).await {
                        Ok(session) => session,
                        Err(e) => {
                            warn!("handshake failed: {:#}", e);
                            return;
                        }
                    };
                    match session.await {
                        Ok(()) => info!("connection closed"),
                        Err(e) => warn!("connection ended with error: {:#}", e),
                    }
                }
                .instrument(info_span!("connection", conn, %peer)),
            );
        }
    }
}

fn is_per_connection(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
    )
}

impl Server for SshServer {
    type Handler = ConnectionHandler;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> Self::Handler {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        ConnectionHandler {
            id,
            peer,
            authorized: self.authorized.clone(),
            commands: self.commands.clone(),
            connection: None,
            channels: HashMap::new(),
        }
    }
}

struct ChannelSlot {
    state: ChannelState,
    events: UnboundedSender<ChannelEvent>,
}

/// 单个连接的协议状态，只归该连接的会话任务所有
pub struct ConnectionHandler {
    id: usize,
    peer: Option<SocketAddr>,
    authorized: Arc<AuthorizedKeySet>,
    commands: Arc<CommandTable>,
    connection: Option<AuthenticatedConnection>,
    channels: HashMap<ChannelId, ChannelSlot>,
}

impl ConnectionHandler {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn connection(&self) -> Option<&AuthenticatedConnection> {
        self.connection.as_ref()
    }

    fn check_key(&self, user: &str, key: &PublicKey) -> Auth {
        let fingerprint = key.fingerprint(HashAlg::Sha256);
        if self.authorized.contains(key) {
            debug!(conn = self.id, user, %fingerprint, "offered key is authorized");
            Auth::Accept
        } else {
            info!(conn = self.id, peer = ?self.peer, user, %fingerprint, "authentication rejected");
            Auth::reject()
        }
    }

    /// 用通道状态机处理一个请求并立即回复
    fn dispatch(
        &mut self,
        channel: ChannelId,
        request: ChannelRequest,
        session: &mut Session,
    ) -> anyhow::Result<()> {
        let kind = request.kind();
        let conn = self.id;

        let Some(slot) = self.channels.get_mut(&channel) else {
            warn!(conn, %channel, request = kind, "request for unknown channel");
            session.channel_failure(channel)?;
            return Ok(());
        };

        match slot.state.handle(request) {
            Ok(Disposition::Accept(event)) => {
                if let Some(event) = event {
                    if slot.events.send(event).is_err() {
                        warn!(conn, %channel, request = kind, "channel worker is gone");
                        session.channel_failure(channel)?;
                        return Ok(());
                    }
                }
                info!(conn, %channel, request = kind, "request accepted");
                session.channel_success(channel)?;
            }
            Ok(Disposition::Reject) => {
                info!(conn, %channel, request = kind, "request refused");
                session.channel_failure(channel)?;
            }
            Err(e) => {
                warn!(conn, %channel, request = kind, "protocol error: {}", e);
                session.channel_failure(channel)?;
            }
        }
        Ok(())
    }

    fn forward(&self, channel: ChannelId, event: ChannelEvent) {
        match self.channels.get(&channel) {
            Some(slot) => {
                if slot.events.send(event).is_err() {
                    trace!(conn = self.id, %channel, "channel worker already finished");
                }
            }
            None => trace!(conn = self.id, %channel, "event for unknown channel"),
        }
    }
}

impl russh::server::Handler for ConnectionHandler {
    type Error = anyhow::Error;

    async fn auth_publickey_offered(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        Ok(self.check_key(user, public_key))
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        let auth = self.check_key(user, public_key);
        if matches!(auth, Auth::Accept) {
            let fingerprint = public_key.fingerprint(HashAlg::Sha256).to_string();
            info!(conn = self.id, peer = ?self.peer, user, %fingerprint, "authentication accepted");
            self.connection = Some(AuthenticatedConnection {
                user: user.to_string(),
                fingerprint,
            });
        }
        Ok(auth)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        let channel_id = channel.id();
        let Some(connection) = &self.connection else {
            warn!(conn = self.id, channel = %channel_id, "session channel before authentication");
            return Ok(false);
        };

        let out = Arc::new(SshChannelCommunicator::new(session.handle(), channel_id));
        let worker = ChannelWorker::new(connection.user.clone(), self.commands.clone(), out);
        let span = info_span!("channel", conn = self.id, user = %connection.user, channel = %channel_id);
        let (events, _task) = span.in_scope(|| worker.spawn());

        self.channels.insert(
            channel_id,
            ChannelSlot {
                state: ChannelState::new(),
                events,
            },
        );
        info!(conn = self.id, channel = %channel_id, open = self.channels.len(), "session channel opened");
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        info!(
            conn = self.id,
            channel = %channel.id(),
            target = %format!("{}:{}", host_to_connect, port_to_connect),
            "direct-tcpip refused: unknown channel type"
        );
        Ok(false)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(conn = self.id, address, port = *port, "global tcpip-forward request discarded");
        Ok(false)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        debug!(conn = self.id, address, port, "global cancel-tcpip-forward request discarded");
        Ok(false)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let pty = PtyRequest {
            term: term.to_string(),
            cols: col_width,
            rows: row_height,
        };
        self.dispatch(channel, ChannelRequest::PtyReq(pty), session)
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        self.dispatch(channel, ChannelRequest::Shell, session)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        self.dispatch(channel, ChannelRequest::Exec(data.to_vec()), session)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        debug!(conn = self.id, %channel, variable_name, "env request");
        self.dispatch(channel, ChannelRequest::Other("env"), session)
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        debug!(conn = self.id, %channel, subsystem = name, "subsystem request");
        self.dispatch(channel, ChannelRequest::Other("subsystem"), session)
    }

    async fn x11_request(
        &mut self,
        channel: ChannelId,
        _single_connection: bool,
        _x11_auth_protocol: &str,
        _x11_auth_cookie: &str,
        _x11_screen_number: u32,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        self.dispatch(channel, ChannelRequest::Other("x11-req"), session)
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        self.dispatch(channel, ChannelRequest::Other("window-change"), session)
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        self.forward(channel, ChannelEvent::Input(Bytes::copy_from_slice(data)));
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        debug!(conn = self.id, %channel, "channel EOF");
        self.forward(channel, ChannelEvent::Eof);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        // 丢弃发送端后 worker 的队列随之结束
        if self.channels.remove(&channel).is_some() {
            info!(conn = self.id, %channel, open = self.channels.len(), "channel closed");
        }
        Ok(())
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        debug!(
            conn = self.id,
            user = ?self.connection.as_ref().map(|c| c.user.as_str()),
            open_channels = self.channels.len(),
            "connection state released"
        );
    }
}
