//! Background jobs and the queue feeding the worker pool.

pub mod classify;
mod resource;
mod worker;

pub use resource::run_resource_job;
pub use worker::WorkerPool;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::error::{HostwrightError, Result};
use crate::model::{DeploymentId, ResourceId, ServerId};
use crate::status::Operation;
use crate::store::Store;
use crate::transport::RemoteTransport;

/// One unit of queued work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Install, update, remove, disable, enable or make-default one resource.
    Resource {
        resource_id: ResourceId,
        operation: Operation,
    },
    /// Bootstrap steps 4 to 8 of a server.
    StackProvision { server_id: ServerId },
    Deploy { deployment_id: DeploymentId },
}

/// Collaborators every job runs against.
#[derive(Clone)]
pub struct JobContext {
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn RemoteTransport>,
    pub config: Arc<AppConfig>,
}

impl JobContext {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn RemoteTransport>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }
}

/// Sending half of the job queue.
#[derive(Debug, Clone)]
pub struct JobQueue {
    sender: mpsc::UnboundedSender<Job>,
}

/// Receiving half, consumed by the worker pool.
#[derive(Debug)]
pub struct JobReceiver {
    receiver: mpsc::UnboundedReceiver<Job>,
}

impl JobQueue {
    pub fn new() -> (Self, JobReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, JobReceiver { receiver })
    }

    pub fn enqueue(&self, job: Job) -> Result<()> {
        tracing::debug!(?job, "Job enqueued");
        self.sender
            .send(job)
            .map_err(|_| HostwrightError::Other(anyhow::anyhow!("job queue is closed")))
    }
}

impl JobReceiver {
    pub async fn recv(&mut self) -> Option<Job> {
        self.receiver.recv().await
    }

    /// Next queued job without waiting.
    pub fn try_recv(&mut self) -> Option<Job> {
        self.receiver.try_recv().ok()
    }
}

/// Runs one job to completion. Failures are recorded on the job's
/// records; nothing is propagated to the worker.
pub async fn run_job(ctx: &JobContext, job: Job) {
    match job {
        Job::Resource {
            resource_id,
            operation,
        } => run_resource_job(ctx, resource_id, operation).await,
        Job::StackProvision { server_id } => {
            crate::provision::run_stack_provisioning(ctx, server_id).await
        }
        Job::Deploy { deployment_id } => crate::deploy::run_deployment(ctx, deployment_id).await,
    }
}
