//! Deployment records: one immutable entry per deployment attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{DeploymentId, Site, SiteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Deploying,
    Success,
    Failed,
}

/// Commit metadata known at trigger time (from a push webhook).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub commit_sha: Option<String>,
    pub author: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub id: DeploymentId,
    pub site_id: SiteId,
    pub status: DeploymentStatus,
    /// Script configured on the site when the deployment was triggered.
    pub deployment_script: String,
    pub branch: String,
    pub commit_sha: Option<String>,
    pub commit_author: Option<String>,
    pub commit_message: Option<String>,
    /// Release directory name (`YYYYmmddHHMMSS`).
    pub release: Option<String>,
    pub output: String,
    pub error_output: String,
    pub exit_code: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Deployment {
    /// Snapshots the site's script and branch. `None` when the site has no
    /// repository.
    pub fn for_site(site: &Site, commit: CommitInfo) -> Option<Self> {
        let repository = site.repository.as_ref()?;
        Some(Self {
            id: DeploymentId::new(),
            site_id: site.id,
            status: DeploymentStatus::Pending,
            deployment_script: site.deployment_script.clone(),
            branch: repository.branch.clone(),
            commit_sha: commit.commit_sha,
            commit_author: commit.author,
            commit_message: commit.message,
            release: None,
            output: String::new(),
            error_output: String::new(),
            exit_code: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        })
    }

    pub fn duration_ms(&self) -> Option<i64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.status,
            DeploymentStatus::Pending | DeploymentStatus::Deploying
        )
    }

    pub fn view(&self) -> DeploymentView {
        let duration_ms = self.duration_ms();
        DeploymentView {
            id: self.id,
            status: self.status,
            exit_code: self.exit_code,
            commit_sha: self.commit_sha.clone(),
            branch: self.branch.clone(),
            duration_ms,
            duration_seconds: duration_ms.map(|ms| ms / 1000),
            is_running: self.is_running(),
            is_success: self.status == DeploymentStatus::Success,
            is_failed: self.status == DeploymentStatus::Failed,
        }
    }
}

/// Read-only status payload polled by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentView {
    pub id: DeploymentId,
    pub status: DeploymentStatus,
    pub exit_code: Option<i32>,
    pub commit_sha: Option<String>,
    pub branch: String,
    pub duration_ms: Option<i64>,
    pub duration_seconds: Option<i64>,
    pub is_running: bool,
    pub is_success: bool,
    pub is_failed: bool,
}
