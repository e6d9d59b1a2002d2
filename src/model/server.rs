//! Server aggregate root.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::resource::{CacheEngine, DatabaseEngine};
use super::ServerId;
use crate::provision::StepMap;
use crate::status::TaskStatus;
use crate::utils::generate_password;

/// Whether the control plane can reach the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Connecting,
    Connected,
    Failed,
}

/// Overall bootstrap progress of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisionStatus {
    Pending,
    Installing,
    Completed,
    Failed,
}

impl fmt::Display for ProvisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Installing => "installing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Software the control plane installs during bootstrap steps 4 to 8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStack {
    #[serde(default = "default_php_version")]
    pub php_version: String,
    #[serde(default = "default_database")]
    pub database: DatabaseEngine,
    #[serde(default = "default_database_version")]
    pub database_version: String,
    #[serde(default = "default_cache")]
    pub cache: Option<CacheEngine>,
}

fn default_php_version() -> String {
    "8.3".to_string()
}

fn default_database() -> DatabaseEngine {
    DatabaseEngine::Mysql
}

fn default_database_version() -> String {
    "8.0".to_string()
}

fn default_cache() -> Option<CacheEngine> {
    Some(CacheEngine::Redis)
}

impl Default for ServerStack {
    fn default() -> Self {
        Self {
            php_version: default_php_version(),
            database: default_database(),
            database_version: default_database_version(),
            cache: default_cache(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerEventKind {
    Provisioning,
    Connection,
    Resource,
}

/// One entry of a server's event history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEvent {
    pub kind: ServerEventKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub ip_address: String,
    pub private_ip_address: Option<String>,
    pub ssh_port: u16,
    pub ssh_user: String,
    #[serde(skip_serializing)]
    pub root_password: String,
    #[serde(skip_serializing)]
    pub database_password: String,
    pub connection_status: ConnectionStatus,
    pub provision_status: ProvisionStatus,
    pub provision: StepMap,
    pub stack: ServerStack,
    pub supervisor_status: Option<TaskStatus>,
    pub scheduler_status: Option<TaskStatus>,
    pub monitoring_status: Option<TaskStatus>,
    pub events: Vec<ServerEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Server {
    /// Registers a host that has not run its bootstrap script yet.
    pub fn new(
        name: impl Into<String>,
        ip_address: impl Into<String>,
        ssh_port: u16,
        ssh_user: impl Into<String>,
        stack: ServerStack,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ServerId::new(),
            name: name.into(),
            ip_address: ip_address.into(),
            private_ip_address: None,
            ssh_port,
            ssh_user: ssh_user.into(),
            root_password: generate_password(32),
            database_password: generate_password(32),
            connection_status: ConnectionStatus::Pending,
            provision_status: ProvisionStatus::Pending,
            provision: StepMap::default(),
            stack,
            supervisor_status: None,
            scheduler_status: None,
            monitoring_status: None,
            events: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn record_event(&mut self, kind: ServerEventKind, message: impl Into<String>) {
        self.events.push(ServerEvent {
            kind,
            message: message.into(),
            created_at: Utc::now(),
        });
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status == ConnectionStatus::Connected
    }

    /// Connected and done with bootstrap; steps 4 to 8 own the stack until then.
    pub fn is_ready(&self) -> bool {
        self.is_connected() && self.provision_status == ProvisionStatus::Completed
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_server_is_pending_with_fresh_credentials() {
        let a = Server::new("web-1", "203.0.113.10", 22, "root", ServerStack::default());
        let b = Server::new("web-2", "203.0.113.11", 22, "root", ServerStack::default());

        assert_eq!(a.connection_status, ConnectionStatus::Pending);
        assert_eq!(a.provision_status, ProvisionStatus::Pending);
        assert!(a.provision.is_empty());
        assert_eq!(a.root_password.len(), 32);
        assert_ne!(a.root_password, b.root_password);
    }

    #[test]
    fn test_credentials_are_not_serialized() {
        let server = Server::new("web-1", "203.0.113.10", 22, "root", ServerStack::default());
        let json = serde_json::to_string(&server).unwrap();
        assert!(!json.contains(&server.root_password));
        assert!(!json.contains("database_password"));
    }
}
