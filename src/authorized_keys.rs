//! The set of public keys allowed to log in.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use russh::keys::ssh_key::authorized_keys::Entry;
use russh::keys::ssh_key::PublicKey;
use tracing::info;

use crate::error::{Error, Result};

/// Immutable set of permitted keys, keyed by their marshaled wire encoding.
///
/// Comments and options on the authorized-keys line do not take part in
/// membership: two lines for the same key with different comments collapse
/// into one entry.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeySet {
    keys: HashSet<Vec<u8>>,
}

impl AuthorizedKeySet {
    /// Parse authorized-keys text. Blank lines and `#` comments are skipped;
    /// any other malformed line fails the whole load.
    pub fn parse(text: &str) -> Result<Self> {
        let mut keys = HashSet::new();

        for (index, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let entry = Entry::from_str(line).map_err(|e| Error::AuthorizedKeys {
                line: index + 1,
                reason: e.to_string(),
            })?;
            let marshaled = marshal(entry.public_key()).map_err(|reason| Error::AuthorizedKeys {
                line: index + 1,
                reason,
            })?;
            keys.insert(marshaled);
        }

        Ok(Self { keys })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes).map_err(|e| Error::AuthorizedKeys {
            line: line_of_offset(bytes, e.valid_up_to()),
            reason: "not valid UTF-8".to_string(),
        })?;
        Self::parse(text)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|source| Error::Config {
            path: path.to_path_buf(),
            source,
        })?;
        let set = Self::from_bytes(&bytes)?;
        info!(path = %path.display(), keys = set.len(), "loaded authorized keys");
        Ok(set)
    }

    pub fn contains(&self, candidate: &PublicKey) -> bool {
        match marshal(candidate) {
            Ok(bytes) => self.keys.contains(&bytes),
            Err(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn marshal(key: &PublicKey) -> std::result::Result<Vec<u8>, String> {
    key.to_bytes().map_err(|e| e.to_string())
}

fn line_of_offset(bytes: &[u8], offset: usize) -> usize {
    bytes[..offset].iter().filter(|b| **b == b'\n').count() + 1
}
