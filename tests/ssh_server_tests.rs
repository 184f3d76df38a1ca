mod common;

use anyhow::Result;
use russh::keys::ssh_key::{HashAlg, PublicKey};
use russh::server::{Auth, Handler, Server};

use sshkit::{ConnectionHandler, SshServer};

use common::{build_server, fixture};

fn alice_public() -> PublicKey {
    PublicKey::from_openssh(&fixture().alice.public_key_openssh).unwrap()
}

#[tokio::test]
async fn test_ssh_server_creation() {
    let server = build_server(vec!["whoami".to_string()]);

    assert_eq!(server.config().bind_address, "127.0.0.1");
    assert_eq!(server.config().port, 0);
    assert_eq!(server.config().allowed_commands, vec!["whoami"]);
}

#[tokio::test]
async fn test_new_client_handler() {
    let mut server = build_server(Vec::new());

    let first = <SshServer as Server>::new_client(&mut server, None);
    let second = <SshServer as Server>::new_client(&mut server, None);

    assert_ne!(first.id(), second.id());
    assert!(first.connection().is_none());
}

#[tokio::test]
async fn test_auth_accepts_authorized_key() -> Result<()> {
    let mut server = build_server(Vec::new());
    let mut handler = <SshServer as Server>::new_client(&mut server, None);
    let key = alice_public();

    let offered = <ConnectionHandler as Handler>::auth_publickey_offered(&mut handler, "alice", &key).await?;
    assert!(matches!(offered, Auth::Accept));

    let auth = <ConnectionHandler as Handler>::auth_publickey(&mut handler, "alice", &key).await?;
    assert!(matches!(auth, Auth::Accept));

    let connection = handler.connection().expect("connection recorded");
    assert_eq!(connection.user, "alice");
    assert_eq!(connection.fingerprint, key.fingerprint(HashAlg::Sha256).to_string());
    assert_eq!(connection.fingerprint, fixture().alice.fingerprint);
    Ok(())
}

#[tokio::test]
async fn test_auth_rejects_unknown_keys() -> Result<()> {
    let mut server = build_server(Vec::new());
    let mut handler = <SshServer as Server>::new_client(&mut server, None);

    // an RSA key that is not listed
    let mallory = PublicKey::from_openssh(&fixture().mallory.public_key_openssh)?;
    let auth = <ConnectionHandler as Handler>::auth_publickey(&mut handler, "alice", &mallory).await?;
    assert!(!matches!(auth, Auth::Accept));

    // a key of another type entirely
    let ed25519 = russh::keys::PrivateKey::random(
        &mut rand::thread_rng(),
        russh::keys::Algorithm::Ed25519,
    )?;
    let auth =
        <ConnectionHandler as Handler>::auth_publickey(&mut handler, "alice", ed25519.public_key()).await?;
    assert!(!matches!(auth, Auth::Accept));

    assert!(handler.connection().is_none());
    Ok(())
}

#[tokio::test]
async fn test_rejection_does_not_depend_on_user() -> Result<()> {
    let mut server = build_server(Vec::new());
    let mut handler = <SshServer as Server>::new_client(&mut server, None);
    let mallory = PublicKey::from_openssh(&fixture().mallory.public_key_openssh)?;

    for user in ["alice", "root", "nobody"] {
        let auth = <ConnectionHandler as Handler>::auth_publickey_offered(&mut handler, user, &mallory).await?;
        assert!(!matches!(auth, Auth::Accept));
    }
    Ok(())
}
