pub mod utils;

pub mod authorized_keys;
pub mod channel;
pub mod cli;
pub mod command_handler;
pub mod error;
pub mod host_key;
pub mod key_manager;
pub mod logging;
pub mod ssh_client;
pub mod ssh_server;
pub mod terminal;

pub use authorized_keys::AuthorizedKeySet;
pub use command_handler::{CommandOutcome, CommandTable};
pub use error::{ClientError, Error, ProtocolError, Result};
pub use host_key::HostKeyPolicy;
pub use key_manager::{generate_keys, GeneratedKeyPair, KeyManager, ServerIdentity};
pub use logging::{setup_logging, LogSettings};
pub use ssh_client::{ClientConfig, ClientSession, RemoteOutcome, SessionErrorKind};
pub use ssh_server::{AuthenticatedConnection, ConnectionHandler, ServerConfig, SshServer};
