//! Provisionable resources: one record per remotely installed unit.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ResourceId, ServerId};
use crate::status::{Lifecycle, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseEngine {
    Mysql,
    Mariadb,
    Postgresql,
}

impl DatabaseEngine {
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Mysql | Self::Mariadb => 3306,
            Self::Postgresql => 5432,
        }
    }

    pub const fn service_name(self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
            Self::Postgresql => "postgresql",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEngine {
    Redis,
    Memcached,
}

impl CacheEngine {
    pub const fn default_port(self) -> u16 {
        match self {
            Self::Redis => 6379,
            Self::Memcached => 11211,
        }
    }

    pub const fn service_name(self) -> &'static str {
        match self {
            Self::Redis => "redis-server",
            Self::Memcached => "memcached",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeFamily {
    Php,
    Node,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallAction {
    Allow,
    Deny,
}

impl FirewallAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// Grouping used by the conflict guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    DatabaseEngine,
    Cache,
    ReverseProxy,
    Runtime(RuntimeFamily),
    Firewall,
    Database,
    DatabaseUser,
    FirewallRule,
    ScheduledTask,
    SupervisorTask,
}

impl Category {
    /// At most one resource of this category may exist per server.
    pub const fn is_exclusive(self) -> bool {
        matches!(
            self,
            Self::DatabaseEngine | Self::Cache | Self::ReverseProxy | Self::Firewall
        )
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DatabaseEngine => "database engine",
            Self::Cache => "cache",
            Self::ReverseProxy => "web server",
            Self::Runtime(RuntimeFamily::Php) => "PHP version",
            Self::Runtime(RuntimeFamily::Node) => "Node.js version",
            Self::Firewall => "firewall",
            Self::Database => "database",
            Self::DatabaseUser => "database user",
            Self::FirewallRule => "firewall rule",
            Self::ScheduledTask => "scheduled task",
            Self::SupervisorTask => "supervisor task",
        };
        f.write_str(s)
    }
}

/// Type-specific configuration of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceSpec {
    DatabaseEngine {
        engine: DatabaseEngine,
        version: String,
        port: u16,
    },
    Cache {
        engine: CacheEngine,
        port: u16,
    },
    ReverseProxy {
        port: u16,
    },
    PhpRuntime {
        version: String,
    },
    NodeRuntime {
        version: String,
    },
    Firewall,
    Database {
        name: String,
        #[serde(default = "default_charset")]
        charset: String,
    },
    DatabaseUser {
        username: String,
        #[serde(skip_serializing)]
        password: String,
        #[serde(default = "default_db_host")]
        host: String,
        #[serde(default)]
        databases: Vec<String>,
    },
    FirewallRule {
        name: String,
        protocol: Protocol,
        port: u16,
        #[serde(default)]
        source: Option<String>,
        action: FirewallAction,
    },
    ScheduledTask {
        command: String,
        user: String,
        frequency: String,
    },
    SupervisorTask {
        command: String,
        user: String,
        #[serde(default = "default_processes")]
        processes: u16,
        #[serde(default)]
        working_directory: Option<String>,
    },
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_processes() -> u16 {
    1
}

impl ResourceSpec {
    pub fn category(&self) -> Category {
        match self {
            Self::DatabaseEngine { .. } => Category::DatabaseEngine,
            Self::Cache { .. } => Category::Cache,
            Self::ReverseProxy { .. } => Category::ReverseProxy,
            Self::PhpRuntime { .. } => Category::Runtime(RuntimeFamily::Php),
            Self::NodeRuntime { .. } => Category::Runtime(RuntimeFamily::Node),
            Self::Firewall => Category::Firewall,
            Self::Database { .. } => Category::Database,
            Self::DatabaseUser { .. } => Category::DatabaseUser,
            Self::FirewallRule { .. } => Category::FirewallRule,
            Self::ScheduledTask { .. } => Category::ScheduledTask,
            Self::SupervisorTask { .. } => Category::SupervisorTask,
        }
    }

    /// Port the resource listens on, if it is a network service.
    pub fn listening_port(&self) -> Option<u16> {
        match self {
            Self::DatabaseEngine { port, .. } | Self::Cache { port, .. } | Self::ReverseProxy { port } => {
                Some(*port)
            }
            _ => None,
        }
    }

    pub fn version(&self) -> Option<&str> {
        match self {
            Self::DatabaseEngine { version, .. }
            | Self::PhpRuntime { version }
            | Self::NodeRuntime { version } => Some(version),
            _ => None,
        }
    }

    pub fn runtime_family(&self) -> Option<RuntimeFamily> {
        match self.category() {
            Category::Runtime(family) => Some(family),
            _ => None,
        }
    }

    /// Value that must be unique among resources of the same category on
    /// one server (version, schema name, user name, ...), with its field.
    pub fn identity(&self) -> Option<(&'static str, String)> {
        match self {
            Self::PhpRuntime { version } | Self::NodeRuntime { version } => {
                Some(("version", version.clone()))
            }
            Self::Database { name, .. } => Some(("name", name.clone())),
            Self::DatabaseUser { username, host, .. } => {
                Some(("user", format!("{}@{}", username, host)))
            }
            Self::FirewallRule { protocol, port, source, .. } => Some((
                "port",
                format!(
                    "{}/{} from {}",
                    port,
                    protocol.as_str(),
                    source.as_deref().unwrap_or("any")
                ),
            )),
            _ => None,
        }
    }

    pub fn supports_update(&self) -> bool {
        !matches!(
            self.category(),
            Category::ReverseProxy | Category::Firewall | Category::Database | Category::FirewallRule
        )
    }

    /// Status a disabled resource of this kind rests in.
    pub fn inactive_status(&self) -> Option<TaskStatus> {
        match self {
            Self::ScheduledTask { .. } => Some(TaskStatus::Disabled),
            Self::SupervisorTask { .. } => Some(TaskStatus::Paused),
            _ => None,
        }
    }

    /// Short human label used in logs and messages.
    pub fn label(&self) -> String {
        match self {
            Self::DatabaseEngine { engine, version, .. } => {
                format!("{} {}", engine.service_name(), version)
            }
            Self::Cache { engine, .. } => engine.service_name().to_string(),
            Self::ReverseProxy { .. } => "nginx".to_string(),
            Self::PhpRuntime { version } => format!("PHP {}", version),
            Self::NodeRuntime { version } => format!("Node.js {}", version),
            Self::Firewall => "ufw".to_string(),
            Self::Database { name, .. } => format!("database \"{}\"", name),
            Self::DatabaseUser { username, .. } => format!("database user \"{}\"", username),
            Self::FirewallRule { name, .. } => format!("firewall rule \"{}\"", name),
            Self::ScheduledTask { command, .. } => format!("scheduled task \"{}\"", command),
            Self::SupervisorTask { command, .. } => format!("supervisor task \"{}\"", command),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Resource {
    pub id: ResourceId,
    pub server_id: ServerId,
    pub spec: ResourceSpec,
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
    /// Configuration requested by an update, applied when the update job succeeds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_spec: Option<ResourceSpec>,
    pub is_cli_default: bool,
    pub is_site_default: bool,
    pub protected: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Resource {
    /// A resource requested by a user, waiting for its install job.
    pub fn new(server_id: ServerId, spec: ResourceSpec) -> Self {
        Self::with_lifecycle(server_id, spec, Lifecycle::pending())
    }

    /// A resource installed by server provisioning.
    pub fn provisioned(server_id: ServerId, spec: ResourceSpec) -> Self {
        Self::with_lifecycle(server_id, spec, Lifecycle::active())
    }

    fn with_lifecycle(server_id: ServerId, spec: ResourceSpec, lifecycle: Lifecycle) -> Self {
        let now = Utc::now();
        Self {
            id: ResourceId::new(),
            server_id,
            spec,
            lifecycle,
            pending_spec: None,
            is_cli_default: false,
            is_site_default: false,
            protected: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> TaskStatus {
        self.lifecycle.status
    }

    pub fn category(&self) -> Category {
        self.spec.category()
    }

    /// Protected resources reject remove and update in every state.
    pub fn is_protected(&self) -> bool {
        self.protected
            || (self.spec.runtime_family().is_some() && (self.is_cli_default || self.is_site_default))
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_serializes_with_type_tag() {
        let spec = ResourceSpec::Cache {
            engine: CacheEngine::Redis,
            port: 6379,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["type"], "cache");
        assert_eq!(json["engine"], "redis");

        let back: ResourceSpec = serde_json::from_value(json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_database_user_password_is_hidden() {
        let spec = ResourceSpec::DatabaseUser {
            username: "app".to_string(),
            password: "s3cret".to_string(),
            host: "localhost".to_string(),
            databases: vec![],
        };
        assert!(!serde_json::to_string(&spec).unwrap().contains("s3cret"));
    }

    #[test]
    fn test_default_runtime_is_protected() {
        let server_id = ServerId::new();
        let mut php = Resource::new(
            server_id,
            ResourceSpec::PhpRuntime {
                version: "8.3".to_string(),
            },
        );
        assert!(!php.is_protected());
        php.is_site_default = true;
        assert!(php.is_protected());

        let mut rule = Resource::new(
            server_id,
            ResourceSpec::FirewallRule {
                name: "ssh".to_string(),
                protocol: Protocol::Tcp,
                port: 22,
                source: None,
                action: FirewallAction::Allow,
            },
        );
        rule.is_cli_default = true;
        assert!(!rule.is_protected());
    }

    #[test]
    fn test_exclusive_categories() {
        assert!(Category::DatabaseEngine.is_exclusive());
        assert!(!Category::Runtime(RuntimeFamily::Php).is_exclusive());
        assert!(!Category::Database.is_exclusive());
    }
}
