//! The eight-step bootstrap map.
//!
//! Steps 1 to 3 are reported by the host itself through the signed
//! callback; steps 4 to 8 are run by the control plane over SSH.

use std::fmt;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

pub const STEP_COUNT: usize = 8;

/// Highest step the bootstrap script reports on its own.
pub const LAST_HOST_STEP: u8 = 3;

const STEP_NAMES: [&str; STEP_COUNT] = [
    "Waiting for connection",
    "Preparing system",
    "Authorizing control plane",
    "Installing PHP",
    "Installing web server",
    "Installing database",
    "Installing cache",
    "Finalizing",
];

/// A validated step number in `1..=8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProvisionStep(u8);

impl ProvisionStep {
    pub const WAITING_FOR_CONNECTION: Self = Self(1);
    pub const PREPARING_SYSTEM: Self = Self(2);
    pub const AUTHORIZING: Self = Self(3);
    pub const PHP: Self = Self(4);
    pub const WEB_SERVER: Self = Self(5);
    pub const DATABASE: Self = Self(6);
    pub const CACHE: Self = Self(7);
    pub const FINALIZING: Self = Self(8);

    pub fn new(number: u8) -> Option<Self> {
        (1..=STEP_COUNT as u8).contains(&number).then_some(Self(number))
    }

    pub const fn number(self) -> u8 {
        self.0
    }

    pub fn name(self) -> &'static str {
        STEP_NAMES[self.index()]
    }

    pub const fn is_host_reported(self) -> bool {
        self.0 <= LAST_HOST_STEP
    }

    /// Steps 4 to 8, in execution order.
    pub fn control_plane() -> impl Iterator<Item = Self> {
        (LAST_HOST_STEP + 1..=STEP_COUNT as u8).map(Self)
    }

    fn index(self) -> usize {
        usize::from(self.0 - 1)
    }
}

impl fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sub-status of one bootstrap step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Installing,
    Completed,
    Failed,
}

impl StepStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Installing => "installing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for StepStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "pending" => Ok(Self::Pending),
            "installing" => Ok(Self::Installing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown step status '{}'", other)),
        }
    }
}

/// Progress of every bootstrap step; unset steps have not been reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepMap {
    steps: [Option<StepStatus>; STEP_COUNT],
}

impl StepMap {
    pub fn get(&self, step: ProvisionStep) -> Option<StepStatus> {
        self.steps[step.index()]
    }

    pub fn set(&mut self, step: ProvisionStep, status: StepStatus) {
        self.steps[step.index()] = Some(status);
    }

    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(Option::is_none)
    }

    /// Fresh-host reset: only `{1: completed}` remains.
    pub fn reset_to_first_completed(&mut self) {
        self.steps = Default::default();
        self.set(ProvisionStep::WAITING_FOR_CONNECTION, StepStatus::Completed);
    }

    /// Reported steps in order.
    pub fn iter(&self) -> impl Iterator<Item = (ProvisionStep, StepStatus)> + '_ {
        self.steps
            .iter()
            .enumerate()
            .filter_map(|(i, status)| status.map(|s| (ProvisionStep(i as u8 + 1), s)))
    }
}

impl Serialize for StepMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (step, status) in self.iter() {
            map.serialize_entry(&step.number().to_string(), &status)?;
        }
        map.end()
    }
}
