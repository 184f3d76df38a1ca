use std::collections::BTreeSet;

use anyhow::Result;
use async_trait::async_trait;
use russh::server::Handle;
use russh::{ChannelId, CryptoVec};

use crate::error::Error;

/// Exit status reported for a command that ran.
pub const STATUS_SUCCESS: u32 = 0;
/// Exit status reported for a command the table does not provide.
pub const STATUS_NOT_FOUND: u32 = 127;

/// 内置命令可见的调用者信息
pub struct CommandContext<'a> {
    pub user: &'a str,
}

type Builtin = fn(&CommandContext<'_>) -> String;

/// 服务器认识的全部命令。新命令只在这里添加，绝不交给 shell 执行
const BUILTINS: &[(&str, Builtin)] = &[("whoami", whoami)];

fn whoami(ctx: &CommandContext<'_>) -> String {
    format!("You are: {}\n", ctx.user)
}

/// Result of running one command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub output: String,
    pub status: u32,
}

impl CommandOutcome {
    pub fn found(&self) -> bool {
        self.status != STATUS_NOT_FOUND
    }
}

/// Closed lookup table of built-in commands, optionally narrowed by an
/// allow-list.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    allowed: Option<BTreeSet<&'static str>>,
}

impl CommandTable {
    /// Table exposing every built-in.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table exposing only `names`. An empty list exposes everything; a name
    /// that is not a built-in is a configuration error.
    pub fn with_allowed<I, S>(names: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut allowed = BTreeSet::new();
        for name in names {
            let name = name.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            match BUILTINS.iter().find(|(builtin, _)| *builtin == name) {
                Some((builtin, _)) => {
                    allowed.insert(*builtin);
                }
                None => return Err(Error::UnknownCommand(name.to_string())),
            }
        }

        Ok(Self {
            allowed: if allowed.is_empty() { None } else { Some(allowed) },
        })
    }

    fn lookup(&self, name: &str) -> Option<Builtin> {
        let (_, run) = BUILTINS.iter().find(|(builtin, _)| *builtin == name)?;
        match &self.allowed {
            Some(allowed) if !allowed.contains(name) => None,
            _ => Some(*run),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lookup(name).is_some()
    }

    /// 调用者实际可执行的命令名，已排序
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = BUILTINS
            .iter()
            .map(|(name, _)| *name)
            .filter(|name| self.contains(name))
            .collect();
        names.sort_unstable();
        names
    }

    /// Run `command` on behalf of `user`. The command string is matched
    /// exactly; there is no argument splitting.
    pub fn execute(&self, user: &str, command: &str) -> CommandOutcome {
        match self.lookup(command) {
            Some(run) => CommandOutcome {
                output: run(&CommandContext { user }),
                status: STATUS_SUCCESS,
            },
            None => CommandOutcome {
                output: format!("Command Not Found: {}\n", command),
                status: STATUS_NOT_FOUND,
            },
        }
    }
}

/// Outbound half of one session channel.
///
/// The channel worker and the interactive terminal only talk to the peer
/// through this trait, so both can be driven by a recording mock in tests.
#[async_trait]
pub trait ChannelCommunicator: Send + Sync {
    async fn send_data(&self, data: &[u8]) -> Result<()>;

    async fn send_exit_status(&self, exit_status: u32) -> Result<()>;

    async fn send_eof(&self) -> Result<()>;

    async fn close_channel(&self) -> Result<()>;
}

/// [`ChannelCommunicator`] backed by the connection's russh handle.
pub struct SshChannelCommunicator {
    handle: Handle,
    channel_id: ChannelId,
}

impl SshChannelCommunicator {
    pub fn new(handle: Handle, channel_id: ChannelId) -> Self {
        Self { handle, channel_id }
    }
}

#[async_trait]
impl ChannelCommunicator for SshChannelCommunicator {
    async fn send_data(&self, data: &[u8]) -> Result<()> {
        self.handle
            .data(self.channel_id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "channel {} is closed, {} bytes dropped",
                    self.channel_id,
                    data.len()
                )
            })
    }

    async fn send_exit_status(&self, exit_status: u32) -> Result<()> {
        self.handle
            .exit_status_request(self.channel_id, exit_status)
            .await
            .map_err(|_| anyhow::anyhow!("failed to send exit status on channel {}", self.channel_id))
    }

    async fn send_eof(&self) -> Result<()> {
        self.handle
            .eof(self.channel_id)
            .await
            .map_err(|_| anyhow::anyhow!("failed to send EOF on channel {}", self.channel_id))
    }

    async fn close_channel(&self) -> Result<()> {
        self.handle
            .close(self.channel_id)
            .await
            .map_err(|_| anyhow::anyhow!("failed to close channel {}", self.channel_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_whoami() {
        let table = CommandTable::new();
        let outcome = table.execute("alice", "whoami");
        assert_eq!(outcome.output, "You are: alice\n");
        assert_eq!(outcome.status, STATUS_SUCCESS);
        assert!(outcome.found());
    }

    #[test]
    fn test_unknown_command_is_never_run() {
        let table = CommandTable::new();
        let outcome = table.execute("alice", "rm -rf /");
        assert_eq!(outcome.output, "Command Not Found: rm -rf /\n");
        assert_eq!(outcome.status, STATUS_NOT_FOUND);
        assert!(!outcome.found());
    }

    #[test]
    fn test_matching_is_exact() {
        let table = CommandTable::new();
        assert!(!table.execute("bob", "whoami ").found());
        assert!(!table.execute("bob", "WHOAMI").found());
        assert!(!table.execute("bob", "").found());
    }

    #[test]
    fn test_allow_list() {
        let table = CommandTable::with_allowed(["whoami"]).unwrap();
        assert_eq!(table.names(), vec!["whoami"]);

        let table = CommandTable::with_allowed(Vec::<String>::new()).unwrap();
        assert!(table.contains("whoami"));

        let err = CommandTable::with_allowed(["whoami", "reboot"]).unwrap_err();
        assert!(matches!(err, Error::UnknownCommand(name) if name == "reboot"));
    }

    #[test]
    fn test_disallowed_builtin_behaves_like_unknown() {
        let table = CommandTable {
            allowed: Some(BTreeSet::new()),
        };
        let outcome = table.execute("carol", "whoami");
        assert_eq!(outcome.output, "Command Not Found: whoami\n");
        assert_eq!(outcome.status, STATUS_NOT_FOUND);
        assert!(table.names().is_empty());
    }
}
