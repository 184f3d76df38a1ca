use std::path::Path;

use sshkit::{
    generate_keys, setup_logging, AuthorizedKeySet, KeyManager, LogSettings, ServerConfig,
    ServerIdentity, SshServer,
};
use tracing::{info, Level};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging(&LogSettings {
        level: Level::DEBUG,
        json: false,
    });

    // host and client keys live next to each other, generated on first run
    let dir = Path::new("demo-keys");
    std::fs::create_dir_all(dir)?;

    let host = KeyManager::new(dir.join("host_rsa"), dir.join("host_rsa.pub"));
    if !host.key_files_exist() {
        host.write_keypair(&generate_keys(2048, Some("sshkit-demo-host"))?)?;
    }
    let client = KeyManager::new(dir.join("client_rsa"), dir.join("client_rsa.pub"));
    if !client.key_files_exist() {
        client.write_keypair(&generate_keys(2048, Some("sshkit-demo-client"))?)?;
    }

    let identity = ServerIdentity::load(host.private_key_path())?;
    let authorized = AuthorizedKeySet::parse(&client.get_public_key_string()?)?;

    let config = ServerConfig {
        bind_address: "127.0.0.1".to_string(),
        port: 2222,
        allowed_commands: vec!["whoami".to_string()],
    };

    info!(
        addr = %config.listen_addr(),
        host_key = %identity.fingerprint(),
        "starting demo server"
    );
    info!(
        "try: sshkit client -p 2222 -u demo -k {} --host-fingerprint '{}' -c whoami",
        client.private_key_path().display(),
        identity.fingerprint()
    );

    let mut server = SshServer::new(config, identity, authorized)?;
    server.run().await?;

    Ok(())
}
