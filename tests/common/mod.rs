#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use sshkit::{
    generate_keys, AuthorizedKeySet, ClientConfig, GeneratedKeyPair, HostKeyPolicy, KeyManager,
    ServerConfig, ServerIdentity, SshServer,
};
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Keys shared by every test in a binary. RSA generation is slow, so it
/// happens once.
pub struct Fixture {
    pub dir: TempDir,
    pub host: GeneratedKeyPair,
    pub alice: GeneratedKeyPair,
    pub mallory: GeneratedKeyPair,
    pub alice_key: PathBuf,
    pub mallory_key: PathBuf,
}

pub fn fixture() -> &'static Fixture {
    static FIXTURE: OnceLock<Fixture> = OnceLock::new();
    FIXTURE.get_or_init(|| {
        let dir = tempfile::tempdir().unwrap();
        let host = generate_keys(2048, Some("host")).unwrap();
        let alice = generate_keys(2048, Some("alice@test")).unwrap();
        let mallory = generate_keys(2048, None).unwrap();

        let alice_key = dir.path().join("alice");
        KeyManager::new(&alice_key, dir.path().join("alice.pub"))
            .write_keypair(&alice)
            .unwrap();
        let mallory_key = dir.path().join("mallory");
        KeyManager::new(&mallory_key, dir.path().join("mallory.pub"))
            .write_keypair(&mallory)
            .unwrap();

        Fixture {
            dir,
            host,
            alice,
            mallory,
            alice_key,
            mallory_key,
        }
    })
}

pub fn build_server(allowed_commands: Vec<String>) -> SshServer {
    let f = fixture();
    let identity = ServerIdentity::from_pem(&f.host.private_key_pem).unwrap();
    let authorized = AuthorizedKeySet::parse(&f.alice.public_key_openssh).unwrap();
    let config = ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 0,
        allowed_commands,
    };
    SshServer::new(config, identity, authorized).unwrap()
}

/// Start a server on an ephemeral port and return its address.
pub async fn start_server() -> SocketAddr {
    let mut server = build_server(Vec::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run_on_listener(listener).await;
    });
    addr
}

pub fn client_config(addr: SocketAddr, user: &str, key_path: &PathBuf) -> ClientConfig {
    ClientConfig {
        host: addr.ip().to_string(),
        port: addr.port(),
        user: user.to_string(),
        key_path: key_path.clone(),
        timeout: Duration::from_secs(20),
        host_key_policy: HostKeyPolicy::pinned(&fixture().host.fingerprint).unwrap(),
    }
}
