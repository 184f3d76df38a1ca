mod common;

use std::sync::Arc;

use russh::keys::ssh_key::PublicKey;
use russh::keys::PrivateKeyWithHashAlg;
use russh::{client, ChannelMsg, Disconnect};

use sshkit::key_manager::parse_private_key;
use sshkit::{ClientError, ClientSession, HostKeyPolicy, RemoteOutcome};

use common::{client_config, fixture, start_server};

async fn run_command(session: &ClientSession, command: &str) -> (RemoteOutcome, String) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let outcome = session.run(command, &mut stdout, &mut stderr).await.unwrap();
    assert!(stderr.is_empty());
    (outcome, String::from_utf8(stdout).unwrap())
}

#[tokio::test]
async fn test_exec_whoami() {
    let addr = start_server().await;
    let session = ClientSession::connect(client_config(addr, "alice", &fixture().alice_key))
        .await
        .unwrap();
    assert_eq!(session.user(), "alice");

    let (outcome, output) = run_command(&session, "whoami").await;
    assert_eq!(outcome, RemoteOutcome::Success);
    assert_eq!(output, "You are: alice\n");

    session.close().await.unwrap();
}

#[tokio::test]
async fn test_exec_unknown_command() {
    let addr = start_server().await;
    let session = ClientSession::connect(client_config(addr, "alice", &fixture().alice_key))
        .await
        .unwrap();

    let (outcome, output) = run_command(&session, "uptime").await;
    assert_eq!(outcome, RemoteOutcome::ExitCode(127));
    assert_eq!(output, "Command Not Found: uptime\n");
}

#[tokio::test]
async fn test_connection_serves_several_channels() {
    let addr = start_server().await;
    let session = ClientSession::connect(client_config(addr, "bob", &fixture().alice_key))
        .await
        .unwrap();

    for _ in 0..3 {
        let (outcome, output) = run_command(&session, "whoami").await;
        assert_eq!(outcome, RemoteOutcome::Success);
        assert_eq!(output, "You are: bob\n");
    }
}

#[tokio::test]
async fn test_unauthorized_key_is_rejected() {
    let addr = start_server().await;
    let err = ClientSession::connect(client_config(addr, "alice", &fixture().mallory_key))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, ClientError::Authentication { ref user } if user == "alice"));

    // the server keeps serving after a failed login
    let session = ClientSession::connect(client_config(addr, "alice", &fixture().alice_key))
        .await
        .unwrap();
    let (outcome, _) = run_command(&session, "whoami").await;
    assert_eq!(outcome, RemoteOutcome::Success);
}

#[tokio::test]
async fn test_wrong_pinned_fingerprint() {
    let addr = start_server().await;
    let mut config = client_config(addr, "alice", &fixture().alice_key);
    config.host_key_policy = HostKeyPolicy::pinned(&fixture().alice.fingerprint).unwrap();

    let err = ClientSession::connect(config).await.err().unwrap();
    assert!(matches!(err, ClientError::HostKeyRejected { .. }));
}

#[tokio::test]
async fn test_known_hosts_policy() {
    let addr = start_server().await;
    let dir = tempfile::tempdir().unwrap();
    let known_hosts = dir.path().join("known_hosts");
    let host_line = fixture().host.public_key_openssh.trim_end();
    std::fs::write(
        &known_hosts,
        format!("[{}]:{} {}\n", addr.ip(), addr.port(), host_line),
    )
    .unwrap();

    let mut config = client_config(addr, "alice", &fixture().alice_key);
    config.host_key_policy = HostKeyPolicy::known_hosts(&known_hosts);
    let session = ClientSession::connect(config).await.unwrap();
    let (outcome, _) = run_command(&session, "whoami").await;
    assert_eq!(outcome, RemoteOutcome::Success);

    // a host that is not listed is refused
    let mut config = client_config(addr, "alice", &fixture().alice_key);
    config.host_key_policy = HostKeyPolicy::known_hosts(dir.path().join("empty"));
    std::fs::write(dir.path().join("empty"), "").unwrap();
    let err = ClientSession::connect(config).await.err().unwrap();
    assert!(matches!(err, ClientError::HostKeyRejected { .. }));
}

#[tokio::test]
async fn test_interactive_session() {
    let addr = start_server().await;
    let session = ClientSession::connect(client_config(addr, "alice", &fixture().alice_key))
        .await
        .unwrap();

    let stdin: &'static [u8] = b"whoami\rnope\rquit\r";
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let outcome = session.shell(stdin, &mut stdout, &mut stderr).await.unwrap();

    let output = String::from_utf8(stdout).unwrap();
    assert_eq!(outcome, RemoteOutcome::Success);
    assert!(output.starts_with("> "));
    assert!(output.contains("You are: alice\r\n"));
    assert!(output.contains("Command not found\r\n"));
    assert!(output.ends_with("Goodbye!\r\n"));
}

/// Bare russh client, for requests `ClientSession` never makes.
struct RawClient;

impl client::Handler for RawClient {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn raw_connect(addr: std::net::SocketAddr) -> client::Handle<RawClient> {
    let mut handle = client::connect(Arc::new(client::Config::default()), addr, RawClient)
        .await
        .unwrap();
    let key = parse_private_key(&fixture().alice.private_key_pem).unwrap();
    let hash_alg = handle.best_supported_rsa_hash().await.unwrap().flatten();
    let auth = handle
        .authenticate_publickey("alice", PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await
        .unwrap();
    assert!(auth.success());
    handle
}

/// Collect channel messages until the first reply to a `want_reply` request.
async fn next_reply(channel: &mut russh::Channel<client::Msg>) -> bool {
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Success => return true,
            ChannelMsg::Failure => return false,
            _ => {}
        }
    }
    panic!("channel closed before the reply");
}

#[tokio::test]
async fn test_direct_tcpip_is_refused() {
    let addr = start_server().await;
    let handle = raw_connect(addr).await;

    let res = handle
        .channel_open_direct_tcpip("127.0.0.1", 80, "127.0.0.1", 40000)
        .await;
    // refused with an open-failure message, not by dropping the connection
    assert!(matches!(res, Err(russh::Error::ChannelOpenFailure(_))));

    // the connection is still usable
    let mut channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "whoami").await.unwrap();
    let mut output = Vec::new();
    let mut status = None;
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => output.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
            ChannelMsg::Close => break,
            _ => {}
        }
    }
    assert_eq!(output, b"You are: alice\n");
    assert_eq!(status, Some(0));

    handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_exec_after_pty_is_refused() {
    let addr = start_server().await;
    let handle = raw_connect(addr).await;

    let mut channel = handle.channel_open_session().await.unwrap();
    channel
        .request_pty(true, "xterm", 80, 24, 0, 0, &[])
        .await
        .unwrap();
    assert!(next_reply(&mut channel).await);

    channel.exec(true, "whoami").await.unwrap();
    assert!(!next_reply(&mut channel).await);
}

#[tokio::test]
async fn test_empty_exec_is_refused() {
    let addr = start_server().await;
    let handle = raw_connect(addr).await;

    let mut channel = handle.channel_open_session().await.unwrap();
    channel.exec(true, "").await.unwrap();
    assert!(!next_reply(&mut channel).await);

    // a refused exec leaves the channel fresh
    channel.exec(true, "whoami").await.unwrap();
    assert!(next_reply(&mut channel).await);
}

#[tokio::test]
async fn test_unsupported_requests_are_refused() {
    let addr = start_server().await;
    let handle = raw_connect(addr).await;

    let mut channel = handle.channel_open_session().await.unwrap();
    channel.request_subsystem(true, "sftp").await.unwrap();
    assert!(!next_reply(&mut channel).await);

    channel.set_env(true, "LANG", "C").await.unwrap();
    assert!(!next_reply(&mut channel).await);
}
