//! Zero-downtime git deployments of sites.

pub mod pipeline;
mod service;
pub mod webhook;

pub use service::{run_deployment, Deployer, WebhookOutcome};
