//! Task status machine shared by every provisionable resource.
//!
//! A resource carries two tracks: the primary `status` and an optional
//! `update_status`, so a resource can stay `Active` (and usable) while an
//! update is queued, running or has failed. All transitions go through
//! [`Lifecycle`]; nothing else writes these fields.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Externally visible state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Installing,
    Updating,
    Active,
    Removing,
    Failed,
    Success,
    Paused,
    Disabled,
}

impl TaskStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Installing => "installing",
            Self::Updating => "updating",
            Self::Active => "active",
            Self::Removing => "removing",
            Self::Failed => "failed",
            Self::Success => "success",
            Self::Paused => "paused",
            Self::Disabled => "disabled",
        }
    }

    /// Installing, updating or removing: a job owns the resource.
    pub const fn is_in_flight(self) -> bool {
        matches!(self, Self::Installing | Self::Updating | Self::Removing)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for TaskStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "installing" => Ok(Self::Installing),
            "updating" => Ok(Self::Updating),
            "active" => Ok(Self::Active),
            "removing" => Ok(Self::Removing),
            "failed" => Ok(Self::Failed),
            "success" => Ok(Self::Success),
            "paused" => Ok(Self::Paused),
            "disabled" => Ok(Self::Disabled),
            _ => Err(format!("unknown task status '{}'", value)),
        }
    }
}

/// Operations a caller can request on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Install,
    Update,
    Remove,
    Retry,
    CancelUpdate,
    Disable,
    Enable,
    MakeCliDefault,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Update => "update",
            Self::Remove => "remove",
            Self::Retry => "retry",
            Self::CancelUpdate => "cancel-update",
            Self::Disable => "disable",
            Self::Enable => "enable",
            Self::MakeCliDefault => "make-cli-default",
        }
    }

    /// Operations that run remote commands through a job.
    pub const fn runs_job(self) -> bool {
        !matches!(self, Self::Retry | Self::CancelUpdate)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An operation was requested from a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cannot {operation} while the resource is {status}{}", .update_status.map(|s| format!(" (update {})", s)).unwrap_or_default())]
pub struct TransitionError {
    pub operation: Operation,
    pub status: TaskStatus,
    pub update_status: Option<TaskStatus>,
}

/// Status fields of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_status: Option<TaskStatus>,
    #[serde(default)]
    pub error_log: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_error_log: Option<String>,
    /// Status to restore when a remove/disable/enable job fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<TaskStatus>,
}

impl Lifecycle {
    /// Lifecycle of a freshly requested install.
    pub fn pending() -> Self {
        Self::with_status(TaskStatus::Pending)
    }

    /// Lifecycle of a resource installed outside a job (server provisioning).
    pub fn active() -> Self {
        Self::with_status(TaskStatus::Active)
    }

    fn with_status(status: TaskStatus) -> Self {
        Self {
            status,
            update_status: None,
            error_log: None,
            update_error_log: None,
            previous_status: None,
        }
    }

    fn update_in_flight(&self) -> bool {
        matches!(
            self.update_status,
            Some(TaskStatus::Pending) | Some(TaskStatus::Updating)
        )
    }

    /// Whether `operation` may be requested from this state.
    pub fn allows(&self, operation: Operation) -> bool {
        let status = self.status;
        match operation {
            Operation::Install => matches!(status, TaskStatus::Failed | TaskStatus::Pending),
            Operation::Update => status == TaskStatus::Active && !self.update_in_flight(),
            Operation::Remove => {
                matches!(status, TaskStatus::Active | TaskStatus::Failed) && !self.update_in_flight()
            }
            Operation::Retry => {
                status == TaskStatus::Failed || self.update_status == Some(TaskStatus::Failed)
            }
            Operation::CancelUpdate => self.update_status.is_some(),
            Operation::Disable | Operation::MakeCliDefault => {
                status == TaskStatus::Active && !self.update_in_flight()
            }
            Operation::Enable => matches!(status, TaskStatus::Paused | TaskStatus::Disabled),
        }
    }

    fn reject(&self, operation: Operation) -> TransitionError {
        TransitionError {
            operation,
            status: self.status,
            update_status: self.update_status,
        }
    }

    /// Applies a requested operation, returning the new status of the
    /// track it touched.
    pub fn apply(&mut self, operation: Operation) -> Result<TaskStatus, TransitionError> {
        if !self.allows(operation) {
            return Err(self.reject(operation));
        }

        match operation {
            Operation::Install => {
                self.status = TaskStatus::Pending;
                self.error_log = None;
                Ok(self.status)
            }
            Operation::Update => {
                self.update_status = Some(TaskStatus::Pending);
                self.update_error_log = None;
                Ok(TaskStatus::Pending)
            }
            Operation::Remove => Ok(self.enter(TaskStatus::Removing)),
            Operation::Disable | Operation::Enable | Operation::MakeCliDefault => {
                Ok(self.enter(TaskStatus::Updating))
            }
            Operation::Retry => {
                if self.status == TaskStatus::Failed {
                    self.status = TaskStatus::Pending;
                    self.error_log = None;
                } else {
                    self.update_status = Some(TaskStatus::Pending);
                    self.update_error_log = None;
                }
                Ok(TaskStatus::Pending)
            }
            Operation::CancelUpdate => {
                self.update_status = None;
                self.update_error_log = None;
                Ok(self.status)
            }
        }
    }

    fn enter(&mut self, transitional: TaskStatus) -> TaskStatus {
        self.previous_status = Some(self.status);
        self.status = transitional;
        self.error_log = None;
        transitional
    }

    /// Job checkpoint: moves the resource into its running state.
    ///
    /// Fails when the resource is no longer waiting for this job, e.g. the
    /// update was cancelled or another job already picked it up.
    pub fn begin(&mut self, operation: Operation) -> Result<(), TransitionError> {
        match operation {
            Operation::Install if self.status == TaskStatus::Pending => {
                self.status = TaskStatus::Installing;
                Ok(())
            }
            Operation::Update
                if self.status == TaskStatus::Active
                    && self.update_status == Some(TaskStatus::Pending) =>
            {
                self.update_status = Some(TaskStatus::Updating);
                Ok(())
            }
            Operation::Remove if self.status == TaskStatus::Removing => Ok(()),
            Operation::Disable | Operation::Enable | Operation::MakeCliDefault
                if self.status == TaskStatus::Updating =>
            {
                Ok(())
            }
            _ => Err(self.reject(operation)),
        }
    }

    /// Whether a job that began `operation` still owns the resource.
    pub fn still_running(&self, operation: Operation) -> bool {
        match operation {
            Operation::Install => self.status == TaskStatus::Installing,
            Operation::Update => self.update_status == Some(TaskStatus::Updating),
            Operation::Remove => self.status == TaskStatus::Removing,
            Operation::Disable | Operation::Enable | Operation::MakeCliDefault => {
                self.status == TaskStatus::Updating
            }
            Operation::Retry | Operation::CancelUpdate => false,
        }
    }

    /// Terminal success of a main-track job.
    pub fn settle(&mut self, status: TaskStatus) {
        self.status = status;
        self.previous_status = None;
        self.error_log = None;
    }

    /// Terminal success of an update job.
    pub fn finish_update(&mut self) {
        self.update_status = None;
        self.update_error_log = None;
    }

    /// Terminal failure of a job; never retried automatically.
    pub fn fail(&mut self, operation: Operation, log: String) {
        match operation {
            Operation::Install => {
                self.status = TaskStatus::Failed;
                self.error_log = Some(log);
            }
            Operation::Update => {
                self.update_status = Some(TaskStatus::Failed);
                self.update_error_log = Some(log);
            }
            _ => {
                self.status = self.previous_status.take().unwrap_or(TaskStatus::Failed);
                self.error_log = Some(log);
            }
        }
    }
}

/// Stand-alone form of [`Lifecycle::allows`]; `None` means the resource
/// does not exist yet, from which only `install` is legal.
pub fn can_transition(current: Option<&Lifecycle>, operation: Operation) -> bool {
    match current {
        None => operation == Operation::Install,
        Some(lifecycle) => lifecycle.allows(operation),
    }
}
