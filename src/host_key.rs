//! Client-side server key verification.

use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use russh::keys::known_hosts::check_known_hosts_path;
use russh::keys::ssh_key::{HashAlg, PublicKey};
use tracing::{error, warn};

use crate::error::{Error, Result};

const SHA256_PREFIX: &str = "SHA256:";

/// How the client decides whether to trust the server's host key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Trust every key. Only for throwaway test setups.
    AcceptAny,
    /// Trust keys recorded in an OpenSSH known_hosts file.
    KnownHostsFile(PathBuf),
    /// Trust exactly one key, identified by its `SHA256:` fingerprint.
    PinnedFingerprint(String),
}

impl HostKeyPolicy {
    /// `$HOME/.ssh/known_hosts`
    pub fn default_known_hosts() -> Result<Self> {
        let home = std::env::var_os("HOME")
            .ok_or_else(|| Error::HostKeyPolicy("HOME is not set, pass --known-hosts".to_string()))?;
        Ok(Self::KnownHostsFile(
            PathBuf::from(home).join(".ssh").join("known_hosts"),
        ))
    }

    pub fn known_hosts(path: impl AsRef<Path>) -> Self {
        Self::KnownHostsFile(path.as_ref().to_path_buf())
    }

    /// Pin a fingerprint as printed by `ssh-keygen -lf` or by `keygen`.
    pub fn pinned(fingerprint: &str) -> Result<Self> {
        let encoded = fingerprint
            .trim()
            .strip_prefix(SHA256_PREFIX)
            .ok_or_else(|| {
                Error::HostKeyPolicy(format!("fingerprint must start with {}", SHA256_PREFIX))
            })?
            .trim_end_matches('=');

        let digest = STANDARD_NO_PAD
            .decode(encoded)
            .map_err(|e| Error::HostKeyPolicy(format!("fingerprint is not base64: {}", e)))?;
        if digest.len() != 32 {
            return Err(Error::HostKeyPolicy(format!(
                "fingerprint decodes to {} bytes, expected 32",
                digest.len()
            )));
        }

        Ok(Self::PinnedFingerprint(format!("{}{}", SHA256_PREFIX, encoded)))
    }

    /// Decide whether `key`, presented by `host:port`, is trusted.
    pub fn check(&self, host: &str, port: u16, key: &PublicKey) -> bool {
        let fingerprint = key.fingerprint(HashAlg::Sha256).to_string();

        match self {
            HostKeyPolicy::AcceptAny => {
                warn!(host, port, %fingerprint, "host key accepted without verification");
                true
            }
            HostKeyPolicy::PinnedFingerprint(pinned) => {
                if *pinned == fingerprint {
                    true
                } else {
                    error!(
                        host,
                        port,
                        expected = %pinned,
                        got = %fingerprint,
                        "host key does not match the pinned fingerprint"
                    );
                    false
                }
            }
            HostKeyPolicy::KnownHostsFile(path) => {
                match check_known_hosts_path(host, port, key, path) {
                    Ok(true) => true,
                    Ok(false) => {
                        error!(
                            host,
                            port,
                            %fingerprint,
                            known_hosts = %path.display(),
                            "unknown host key; verify the fingerprint out of band, then add the host to known_hosts or pass --host-fingerprint"
                        );
                        false
                    }
                    Err(russh::keys::Error::KeyChanged { .. }) => {
                        error!(
                            host,
                            port,
                            %fingerprint,
                            known_hosts = %path.display(),
                            "HOST KEY CHANGED, refusing to connect"
                        );
                        false
                    }
                    Err(e) => {
                        error!(
                            host,
                            port,
                            known_hosts = %path.display(),
                            "cannot check known_hosts: {}",
                            e
                        );
                        false
                    }
                }
            }
        }
    }
}
