//! Remote command transport.
//!
//! A job opens one session per run and executes its commands in order.
//! Execution stops at the first failing command unless that command is
//! marked best-effort. Transport failures (connect, auth, timeout) are
//! recorded as a failed command so jobs handle them like a non-zero exit.

mod recording;
mod ssh;

pub use recording::RecordingTransport;
pub use ssh::{SshSettings, SshTransport};

use async_trait::async_trait;
use thiserror::Error;

use crate::model::Server;

/// Exit code recorded when the transport itself failed.
pub const TRANSPORT_FAILURE_EXIT: i32 = -1;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {host}: {message}")]
    Connect { host: String, message: String },

    #[error("Authentication failed for {user}@{host}: {message}")]
    Authentication {
        user: String,
        host: String,
        message: String,
    },

    #[error("Command timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("SSH channel error: {0}")]
    Channel(String),

    #[error("SSH protocol error: {0}")]
    Protocol(#[from] russh::Error),
}

/// One shell script to run on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCommand {
    pub script: String,
    /// A failure is recorded but does not stop the sequence.
    pub best_effort: bool,
}

impl RemoteCommand {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            best_effort: false,
        }
    }

    pub fn best_effort(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            best_effort: true,
        }
    }
}

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn transport_failure(command: &str, error: &TransportError) -> Self {
        Self {
            command: command.to_string(),
            exit_code: TRANSPORT_FAILURE_EXIT,
            stdout: String::new(),
            stderr: error.to_string(),
        }
    }
}

/// Outcome of a command sequence.
#[derive(Debug, Clone, Default)]
pub struct Execution {
    pub results: Vec<CommandResult>,
    failed_at: Option<usize>,
}

impl Execution {
    pub fn success(&self) -> bool {
        self.failed_at.is_none()
    }

    /// The command that stopped the sequence.
    pub fn failure(&self) -> Option<&CommandResult> {
        self.failed_at.and_then(|i| self.results.get(i))
    }

    /// Exit code of the sequence: the failing command's or 0.
    pub fn exit_code(&self) -> i32 {
        self.failure().map_or(0, |r| r.exit_code)
    }

    pub fn stdout(&self) -> String {
        self.joined(|r| &r.stdout)
    }

    pub fn stderr(&self) -> String {
        self.joined(|r| &r.stderr)
    }

    /// Stdout of the last command that ran.
    pub fn last_stdout(&self) -> Option<&str> {
        self.results.last().map(|r| r.stdout.trim())
    }

    fn joined(&self, field: impl Fn(&CommandResult) -> &String) -> String {
        self.results
            .iter()
            .map(|r| field(r).as_str())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// An open channel to one host.
#[async_trait]
pub trait RemoteSession: Send {
    async fn run(&mut self, command: &RemoteCommand) -> Result<CommandResult, TransportError>;

    async fn close(&mut self) {}
}

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    async fn connect(&self, server: &Server) -> Result<Box<dyn RemoteSession>, TransportError>;

    /// Runs `commands` in order on `server`.
    async fn execute(&self, server: &Server, commands: &[RemoteCommand]) -> Execution {
        let mut execution = Execution::default();

        let mut session = match self.connect(server).await {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(server_id = %server.id, error = %e, "Remote connection failed");
                let command = commands.first().map(|c| c.script.as_str()).unwrap_or_default();
                execution
                    .results
                    .push(CommandResult::transport_failure(command, &e));
                execution.failed_at = Some(0);
                return execution;
            }
        };

        for command in commands {
            let result = match session.run(command).await {
                Ok(result) => result,
                Err(e) => CommandResult::transport_failure(&command.script, &e),
            };
            let failed = !result.success();
            let transport_failed = result.exit_code == TRANSPORT_FAILURE_EXIT;
            execution.results.push(result);

            if failed && (!command.best_effort || transport_failed) {
                execution.failed_at = Some(execution.results.len() - 1);
                break;
            }
            if failed {
                tracing::debug!(server_id = %server.id, "Best-effort command failed, continuing");
            }
        }

        session.close().await;
        execution
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServerStack;

    fn server() -> Server {
        Server::new("web-1", "203.0.113.10", 22, "root", ServerStack::default())
    }

    #[tokio::test]
    async fn test_stops_at_first_failure() {
        let transport = RecordingTransport::new();
        transport.fail_when("apt-get install", 100, "E: Unable to locate package");

        let execution = transport
            .execute(
                &server(),
                &[
                    RemoteCommand::new("apt-get update"),
                    RemoteCommand::new("apt-get install -y redis-server"),
                    RemoteCommand::new("systemctl enable redis-server"),
                ],
            )
            .await;

        assert!(!execution.success());
        assert_eq!(execution.exit_code(), 100);
        assert_eq!(execution.results.len(), 2);
        assert_eq!(transport.commands().len(), 2);
        assert!(execution.stderr().contains("Unable to locate"));
    }

    #[tokio::test]
    async fn test_best_effort_failure_continues() {
        let transport = RecordingTransport::new();
        transport.fail_when("mkdir", 1, "exists");

        let execution = transport
            .execute(
                &server(),
                &[
                    RemoteCommand::best_effort("mkdir /var/log/app"),
                    RemoteCommand::new("touch /var/log/app/x"),
                ],
            )
            .await;

        assert!(execution.success());
        assert_eq!(execution.exit_code(), 0);
        assert_eq!(execution.results.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_a_failed_command() {
        let transport = RecordingTransport::new();
        transport.refuse_connections();

        let execution = transport
            .execute(&server(), &[RemoteCommand::new("true")])
            .await;

        assert!(!execution.success());
        assert_eq!(execution.exit_code(), TRANSPORT_FAILURE_EXIT);
        assert!(transport.commands().is_empty());
    }
}
