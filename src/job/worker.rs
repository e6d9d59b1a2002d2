//! Fixed-size pool of tokio workers draining the job queue.

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{run_job, JobContext, JobReceiver};

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `size` workers. Each job runs to completion on one worker;
    /// workers exit once every queue sender is dropped.
    pub fn spawn(ctx: JobContext, receiver: JobReceiver, size: usize) -> Self {
        let receiver = Arc::new(Mutex::new(receiver));
        let handles = (0..size.max(1))
            .map(|worker| {
                let ctx = ctx.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    loop {
                        let job = receiver.lock().await.recv().await;
                        let Some(job) = job else { break };
                        tracing::debug!(worker, ?job, "Job started");
                        run_job(&ctx, job).await;
                    }
                    tracing::debug!(worker, "Worker stopped");
                })
            })
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker to drain the queue and exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::job::{Job, JobQueue};
    use crate::model::ServerId;
    use crate::store::MemoryStore;
    use crate::transport::RecordingTransport;

    #[tokio::test]
    async fn test_pool_drains_queue_and_stops() {
        let ctx = JobContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingTransport::new()),
            Arc::new(AppConfig::default()),
        );
        let (queue, receiver) = JobQueue::new();
        let pool = WorkerPool::spawn(ctx, receiver, 2);
        assert_eq!(pool.size(), 2);

        // Unknown server: the job logs and returns.
        queue
            .enqueue(Job::StackProvision {
                server_id: ServerId::new(),
            })
            .unwrap();
        drop(queue);
        pool.join().await;
    }
}
