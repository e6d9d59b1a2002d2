//! Sites deployed onto a server from a git repository.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DeploymentId, ResourceId, ServerId, SiteId};
use crate::utils::generate_password;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Clone URL, e.g. `git@github.com:acme/shop.git`.
    pub url: String,
    /// `owner/name` as reported by the source-control webhook.
    pub full_name: String,
    pub branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedPathKind {
    Directory,
    File,
}

/// Mutable path that survives across releases through a symlink into
/// the site's `shared` directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedPath {
    /// Path relative to the release root.
    pub path: String,
    pub kind: SharedPathKind,
}

impl SharedPath {
    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: SharedPathKind::Directory,
        }
    }

    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: SharedPathKind::File,
        }
    }
}

/// Uploaded storage, persisted env file, vendor directory and asset
/// build output.
pub fn default_shared_paths() -> Vec<SharedPath> {
    vec![
        SharedPath::directory("storage"),
        SharedPath::file(".env"),
        SharedPath::directory("vendor"),
        SharedPath::directory("public/build"),
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct Site {
    pub id: SiteId,
    pub server_id: ServerId,
    pub domain: String,
    pub repository: Option<Repository>,
    pub php_version: Option<String>,
    pub node_version: Option<String>,
    pub database_id: Option<ResourceId>,
    pub deployment_script: String,
    pub shared_paths: Vec<SharedPath>,
    pub run_migrations: bool,
    pub auto_deploy: bool,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    pub last_deployed_at: Option<DateTime<Utc>>,
    /// Deployment currently running on the host; one at a time per site.
    pub active_deployment: Option<DeploymentId>,
    pub created_at: DateTime<Utc>,
}

impl Site {
    pub fn new(server_id: ServerId, domain: impl Into<String>) -> Self {
        Self {
            id: SiteId::new(),
            server_id,
            domain: domain.into(),
            repository: None,
            php_version: None,
            node_version: None,
            database_id: None,
            deployment_script: String::new(),
            shared_paths: default_shared_paths(),
            run_migrations: false,
            auto_deploy: false,
            webhook_secret: generate_password(40),
            last_deployed_at: None,
            active_deployment: None,
            created_at: Utc::now(),
        }
    }

    /// Directory holding `releases/`, `shared/` and the `current` link.
    pub fn root_path(&self, sites_user: &str) -> String {
        format!("/home/{}/{}", sites_user, self.domain)
    }
}
