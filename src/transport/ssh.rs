//! SSH transport over russh.

use std::net::ToSocketAddrs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};

use super::{CommandResult, RemoteCommand, RemoteSession, RemoteTransport, TransportError};
use crate::config::AppConfig;
use crate::model::Server;

/// Connection settings shared by every session.
#[derive(Debug, Clone)]
pub struct SshSettings {
    /// Private key the control plane authenticates with.
    pub key_path: PathBuf,
    /// Per-command timeout.
    pub command_timeout: Duration,
}

impl From<&AppConfig> for SshSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            key_path: config.ssh_key_path(),
            command_timeout: config.command_timeout(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshTransport {
    settings: SshSettings,
}

impl SshTransport {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl RemoteTransport for SshTransport {
    async fn connect(&self, server: &Server) -> Result<Box<dyn RemoteSession>, TransportError> {
        let russh_config = Arc::new(client::Config {
            inactivity_timeout: Some(self.settings.command_timeout + Duration::from_secs(30)),
            keepalive_interval: Some(Duration::from_secs(15)),
            keepalive_max: 4,
            ..Default::default()
        });

        let addr = format!("{}:{}", server.ip_address, server.ssh_port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Connect {
                host: server.ip_address.clone(),
                message: format!("failed to resolve: {}", e),
            })?
            .next()
            .ok_or_else(|| TransportError::Connect {
                host: server.ip_address.clone(),
                message: "no address found".to_string(),
            })?;

        let mut session = client::connect(russh_config, addr, ClientHandler)
            .await
            .map_err(|e| TransportError::Connect {
                host: server.ip_address.clone(),
                message: e.to_string(),
            })?;

        let key = russh_keys::load_secret_key(&self.settings.key_path, None).map_err(|e| {
            TransportError::Authentication {
                user: server.ssh_user.clone(),
                host: server.ip_address.clone(),
                message: format!("failed to load {}: {}", self.settings.key_path.display(), e),
            }
        })?;

        let authenticated = session
            .authenticate_publickey(&server.ssh_user, Arc::new(key))
            .await
            .map_err(|e| TransportError::Authentication {
                user: server.ssh_user.clone(),
                host: server.ip_address.clone(),
                message: e.to_string(),
            })?;
        if !authenticated {
            return Err(TransportError::Authentication {
                user: server.ssh_user.clone(),
                host: server.ip_address.clone(),
                message: "server rejected the control plane key".to_string(),
            });
        }

        tracing::debug!(server_id = %server.id, host = %server.ip_address, "SSH session opened");

        Ok(Box::new(SshSession {
            handle: session,
            timeout: self.settings.command_timeout,
        }))
    }
}

struct SshSession {
    handle: Handle<ClientHandler>,
    timeout: Duration,
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn run(&mut self, command: &RemoteCommand) -> Result<CommandResult, TransportError> {
        match tokio::time::timeout(self.timeout, exec(&self.handle, &command.script)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                seconds: self.timeout.as_secs(),
            }),
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("SSH disconnect failed: {}", e);
        }
    }
}

/// Wraps `script` so it runs in a clean, fail-fast bash.
fn wrap(script: &str) -> String {
    let body = format!("set -eo pipefail\n{}", script);
    format!(
        "bash --norc --noprofile -c {}",
        crate::utils::shell_quote(&body)
    )
}

async fn exec(handle: &Handle<ClientHandler>, script: &str) -> Result<CommandResult, TransportError> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| TransportError::Channel(format!("failed to open channel: {}", e)))?;

    channel
        .exec(true, wrap(script).as_bytes())
        .await
        .map_err(|e| TransportError::Channel(format!("failed to execute command: {}", e)))?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;

    loop {
        match channel.wait().await {
            Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
            Some(ChannelMsg::ExtendedData { data, ext }) if ext == 1 => {
                stderr.extend_from_slice(&data)
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => exit_code = Some(exit_status),
            Some(ChannelMsg::Close) | None => break,
            _ => {}
        }
    }

    let exit_code = exit_code.ok_or_else(|| {
        TransportError::Channel("channel closed without an exit status".to_string())
    })?;

    Ok(CommandResult {
        command: script.to_string(),
        exit_code: i32::try_from(exit_code).unwrap_or(i32::MAX),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Accepts any host key: managed hosts are freshly imaged and rekeyed.
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = TransportError;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_quotes_script() {
        let wrapped = wrap("echo 'hi'");
        assert!(wrapped.starts_with("bash --norc --noprofile -c 'set -eo pipefail\n"));
        assert!(wrapped.contains("echo '\\''hi'\\''"));
    }

    #[test]
    fn test_settings_from_config() {
        let config = AppConfig {
            ssh_key_path: "/keys/id_ed25519".to_string(),
            command_timeout: "90s".to_string(),
            ..Default::default()
        };
        let settings = SshSettings::from(&config);
        assert_eq!(settings.key_path, PathBuf::from("/keys/id_ed25519"));
        assert_eq!(settings.command_timeout, Duration::from_secs(90));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_connect_error() {
        let server = crate::model::Server::new(
            "web-1",
            "127.0.0.1",
            1,
            "root",
            crate::model::ServerStack::default(),
        );
        let transport = SshTransport::new(SshSettings {
            key_path: PathBuf::from("/nonexistent"),
            command_timeout: Duration::from_secs(1),
        });

        let result = transport.connect(&server).await;
        assert!(matches!(result, Err(TransportError::Connect { .. })));
    }
}
