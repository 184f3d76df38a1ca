//! Error types shared by the key, server and client modules.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Setup-time errors: configuration, key material and listener failures.
///
/// Everything here is fatal to the process that hits it. The CLI reports the
/// error and exits non-zero before (or instead of) serving.
#[derive(Debug, Error)]
pub enum Error {
    /// A key or authorized-keys file is missing or unreadable
    #[error("failed to read {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Private or public key material could not be decoded
    #[error("failed to parse key: {0}")]
    KeyParse(String),

    /// An authorized-keys entry is malformed; the whole file is rejected
    #[error("authorized keys line {line}: {reason}")]
    AuthorizedKeys { line: usize, reason: String },

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("RSA key size must be between 2048 and 16384 bits, got {bits}")]
    InvalidKeySize { bits: usize },

    /// An allowed-commands entry names something the server does not provide
    #[error("unknown command in allow-list: {0}")]
    UnknownCommand(String),

    #[error("invalid host key policy: {0}")]
    HostKeyPolicy(String),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The listening socket itself failed; the accept loop stops
    #[error("listener failed: {0}")]
    Listener(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// A channel request the server refuses to act on.
///
/// Handled per request: the request is answered with failure and the
/// channel (and connection) keep running.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("exec request carries an empty command")]
    EmptyCommand,

    #[error("exec command is not valid UTF-8")]
    InvalidUtf8,

    #[error("exec command contains a NUL byte")]
    EmbeddedNul,

    /// The request is not valid in the channel's current mode
    #[error("{request} is not allowed after the channel entered {mode} mode")]
    ModeConflict {
        request: &'static str,
        mode: &'static str,
    },
}

/// Client-side failures, each tagged with the stage that failed.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("key load failed: {path}: {source}")]
    KeyLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("key parse failed: {0}")]
    KeyParse(String),

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("dial timed out after {0:?}")]
    Timeout(Duration),

    #[error("host key for {host} was rejected by the host key policy")]
    HostKeyRejected { host: String },

    /// Deliberately vague: the server never says why
    #[error("authentication failed for user {user}")]
    Authentication { user: String },

    #[error("session failed: {0}")]
    Session(String),

    #[error("exec failed: {0}")]
    Exec(String),

    #[error("shell failed: {0}")]
    Shell(String),
}

impl From<Error> for ClientError {
    fn from(err: Error) -> Self {
        match err {
            Error::Config { path, source } => ClientError::KeyLoad { path, source },
            other => ClientError::KeyParse(other.to_string()),
        }
    }
}
