//! Transport that records commands instead of running them.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use super::{CommandResult, RemoteCommand, RemoteSession, RemoteTransport, TransportError};
use crate::model::Server;

#[derive(Debug, Clone)]
struct Rule {
    needle: String,
    exit_code: i32,
    stderr: String,
}

#[derive(Debug, Default)]
struct Recorded {
    commands: Vec<String>,
    failures: Vec<Rule>,
    stdout: Vec<(String, String)>,
    refuse: bool,
}

/// Records every command; scripted substrings fail or answer with stdout.
#[derive(Debug, Clone, Default)]
pub struct RecordingTransport {
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Commands containing `needle` exit with `exit_code`.
    pub fn fail_when(&self, needle: &str, exit_code: i32, stderr: &str) {
        self.lock().failures.push(Rule {
            needle: needle.to_string(),
            exit_code,
            stderr: stderr.to_string(),
        });
    }

    /// Commands containing `needle` print `stdout`.
    pub fn respond_with(&self, needle: &str, stdout: &str) {
        self.lock()
            .stdout
            .push((needle.to_string(), stdout.to_string()));
    }

    pub fn refuse_connections(&self) {
        self.lock().refuse = true;
    }

    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Every recorded command joined, for substring assertions.
    pub fn transcript(&self) -> String {
        self.lock().commands.join("\n")
    }
}

struct RecordingSession {
    recorded: Arc<Mutex<Recorded>>,
}

#[async_trait]
impl RemoteSession for RecordingSession {
    async fn run(&mut self, command: &RemoteCommand) -> Result<CommandResult, TransportError> {
        let mut recorded = self
            .recorded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        recorded.commands.push(command.script.clone());

        let stdout = recorded
            .stdout
            .iter()
            .find(|(needle, _)| command.script.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();

        let failure = recorded
            .failures
            .iter()
            .find(|rule| command.script.contains(rule.needle.as_str()))
            .cloned();

        Ok(CommandResult {
            command: command.script.clone(),
            exit_code: failure.as_ref().map_or(0, |r| r.exit_code),
            stdout,
            stderr: failure.map(|r| r.stderr).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl RemoteTransport for RecordingTransport {
    async fn connect(&self, server: &Server) -> Result<Box<dyn RemoteSession>, TransportError> {
        if self.lock().refuse {
            return Err(TransportError::Connect {
                host: server.ip_address.clone(),
                message: "Connection refused".to_string(),
            });
        }
        Ok(Box::new(RecordingSession {
            recorded: self.recorded.clone(),
        }))
    }
}
