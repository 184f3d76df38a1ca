use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::key_manager::DEFAULT_RSA_BITS;

#[derive(Parser, Debug)]
#[command(name = "sshkit")]
#[command(about = "Generate SSH keys, serve a restricted command set over SSH, and talk to it")]
#[command(version)]
pub struct Cli {
    /// Log verbosity (SSHKIT_LOG overrides it with a full filter)
    #[arg(long, global = true, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log as JSON lines
    #[arg(long, global = true, env = "SSHKIT_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate an RSA key pair
    Keygen(KeygenArgs),

    /// Run the SSH server
    Server(ServerArgs),

    /// Connect to an SSH server and run a command or an interactive session
    Client(ClientArgs),
}

#[derive(Args, Debug)]
pub struct KeygenArgs {
    /// Where to write the private key
    #[arg(long, default_value = "id_rsa")]
    pub private_key: PathBuf,

    /// Where to write the public key
    #[arg(long, default_value = "id_rsa.pub")]
    pub public_key: PathBuf,

    /// Key size in bits (2048..=16384)
    #[arg(long, default_value_t = DEFAULT_RSA_BITS)]
    pub bits: usize,

    /// Comment appended to the public key line
    #[arg(long)]
    pub comment: Option<String>,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Host private key
    #[arg(long)]
    pub key: PathBuf,

    /// File listing the public keys allowed to log in
    #[arg(long)]
    pub authorized_keys: PathBuf,

    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    #[arg(short, long, default_value_t = 2022)]
    pub port: u16,

    /// Comma-separated commands callers may run (empty for every built-in)
    #[arg(long, value_delimiter = ',')]
    pub allowed_commands: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    #[arg(long, default_value = "localhost")]
    pub host: String,

    #[arg(short, long, default_value_t = 22)]
    pub port: u16,

    #[arg(short, long)]
    pub user: String,

    /// Private key used to authenticate
    #[arg(short, long)]
    pub key: PathBuf,

    /// Command to run; without it an interactive session is started
    #[arg(short, long)]
    pub cmd: Option<String>,

    /// Connect and authentication timeout, e.g. 10s or 1m
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub timeout: Duration,

    /// known_hosts file used to verify the server (default ~/.ssh/known_hosts)
    #[arg(long, conflicts_with_all = ["host_fingerprint", "insecure_accept_any_host_key"])]
    pub known_hosts: Option<PathBuf>,

    /// Trust only the server key with this SHA256 fingerprint
    #[arg(long, conflicts_with = "insecure_accept_any_host_key")]
    pub host_fingerprint: Option<String>,

    /// Skip host key verification entirely
    #[arg(long)]
    pub insecure_accept_any_host_key: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
