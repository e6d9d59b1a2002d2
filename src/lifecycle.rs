//! Resource lifecycle requests.
//!
//! Each request is checked in a fixed order: protected resources first,
//! then the status machine, then the conflict guard. Only a request that
//! passes all three is persisted, and only then is its job queued.
//! Rejections leave the resource untouched.

use std::sync::Arc;

use crate::error::{HostwrightError, Result};
use crate::guard;
use crate::job::{Job, JobQueue};
use crate::model::{Resource, ResourceId, ResourceSpec, ServerId};
use crate::status::{Operation, TaskStatus, TransitionError};
use crate::store::{Mutation, Store};

#[derive(Clone)]
pub struct ResourceService {
    store: Arc<dyn Store>,
    queue: JobQueue,
}

impl ResourceService {
    pub fn new(store: Arc<dyn Store>, queue: JobQueue) -> Self {
        Self { store, queue }
    }

    /// Records a `Pending` resource and queues its install job.
    pub async fn request_install(&self, server_id: ServerId, spec: ResourceSpec) -> Result<Resource> {
        let server = self.store.server(server_id).await?;
        if !server.is_connected() {
            return Err(HostwrightError::conflict(format!(
                "{} is not connected yet; resources can be installed once provisioning has connected it.",
                server.name
            )));
        }
        if !server.is_ready() {
            return Err(HostwrightError::conflict(format!(
                "{} is still provisioning ({}); resources can be installed once it has completed.",
                server.name, server.provision_status
            )));
        }

        let candidate = spec.clone();
        let resource = self
            .store
            .insert_resource(
                Resource::new(server_id, spec),
                Box::new(move |existing| Ok(guard::check_install(&candidate, existing)?)),
                None,
            )
            .await?;

        self.enqueue(&resource, Operation::Install)?;
        Ok(resource)
    }

    /// Queues an update towards `target`. The resource keeps its current
    /// configuration until the update job succeeds.
    pub async fn request_update(&self, resource_id: ResourceId, target: ResourceSpec) -> Result<Resource> {
        let resource = self.checked(resource_id, Operation::Update).await?;
        if !resource.spec.supports_update() {
            return Err(HostwrightError::conflict(format!(
                "A {} cannot be updated.",
                resource.category()
            )));
        }

        let siblings = self.siblings(&resource).await?;
        guard::check_update(&resource, &target, &siblings)?;

        self.commit(
            resource_id,
            Operation::Update,
            Box::new(move |r| {
                r.pending_spec = Some(target);
                Ok(())
            }),
        )
        .await
    }

    pub async fn request_remove(&self, resource_id: ResourceId) -> Result<Resource> {
        let resource = self.checked(resource_id, Operation::Remove).await?;
        self.check_dependents(&resource, Operation::Remove).await?;
        self.commit(resource_id, Operation::Remove, unchanged()).await
    }

    /// Clears the failure and queues the failed job again. A failed install
    /// no longer holds its category, port or identity, so it goes through
    /// the install guard again.
    pub async fn retry(&self, resource_id: ResourceId) -> Result<Resource> {
        self.checked(resource_id, Operation::Retry).await?;
        let resource = self
            .store
            .update_resource_checked(
                resource_id,
                transition(Operation::Retry, unchanged()),
                Box::new(|r, siblings| {
                    if r.status() == TaskStatus::Pending {
                        guard::check_install(&r.spec, siblings)?;
                    }
                    Ok(())
                }),
            )
            .await?;

        let operation = if resource.status() == TaskStatus::Pending {
            Operation::Install
        } else {
            Operation::Update
        };
        self.enqueue(&resource, operation)?;
        Ok(resource)
    }

    /// Drops a queued, running or failed update. A running update job
    /// discards its result when it finishes.
    pub async fn cancel_update(&self, resource_id: ResourceId) -> Result<Resource> {
        self.checked(resource_id, Operation::CancelUpdate).await?;
        let resource = self
            .store
            .update_resource(
                resource_id,
                transition(
                    Operation::CancelUpdate,
                    Box::new(|r| {
                        r.pending_spec = None;
                        Ok(())
                    }),
                ),
                None,
            )
            .await?;
        tracing::info!(%resource_id, "Update cancelled");
        Ok(resource)
    }

    pub async fn disable(&self, resource_id: ResourceId) -> Result<Resource> {
        let resource = self.checked(resource_id, Operation::Disable).await?;
        require_pausable(&resource)?;
        self.check_dependents(&resource, Operation::Disable).await?;
        self.commit(resource_id, Operation::Disable, unchanged()).await
    }

    pub async fn enable(&self, resource_id: ResourceId) -> Result<Resource> {
        let resource = self.checked(resource_id, Operation::Enable).await?;
        require_pausable(&resource)?;
        self.commit(resource_id, Operation::Enable, unchanged()).await
    }

    /// Queues switching the server's CLI runtime to this one.
    pub async fn make_cli_default(&self, resource_id: ResourceId) -> Result<Resource> {
        let resource = self.checked(resource_id, Operation::MakeCliDefault).await?;
        if resource.spec.runtime_family().is_none() {
            return Err(HostwrightError::conflict(format!(
                "Only language runtimes can be the CLI default, not a {}.",
                resource.category()
            )));
        }
        if resource.is_cli_default {
            return Err(HostwrightError::conflict(format!(
                "{} is already the CLI default.",
                resource.spec.label()
            )));
        }
        self.commit(resource_id, Operation::MakeCliDefault, unchanged()).await
    }

    /// Protected check, then the status machine, against the stored record.
    async fn checked(&self, resource_id: ResourceId, operation: Operation) -> Result<Resource> {
        let resource = self.store.resource(resource_id).await?;
        guard::check_protected(&resource, operation)?;
        if !resource.lifecycle.allows(operation) {
            return Err(rejection(&resource, operation).into());
        }
        Ok(resource)
    }

    async fn siblings(&self, resource: &Resource) -> Result<Vec<Resource>> {
        Ok(self
            .store
            .resources(resource.server_id)
            .await?
            .into_iter()
            .filter(|r| r.id != resource.id)
            .collect())
    }

    async fn check_dependents(&self, resource: &Resource, operation: Operation) -> Result<()> {
        let siblings = self.siblings(resource).await?;
        let sites = self.store.sites(resource.server_id).await?;
        guard::check_dependents(resource, operation, &siblings, &sites)?;
        Ok(())
    }

    /// Persists the transition and queues the operation's job.
    async fn commit(
        &self,
        resource_id: ResourceId,
        operation: Operation,
        edit: Mutation<Resource>,
    ) -> Result<Resource> {
        let resource = self
            .store
            .update_resource(resource_id, transition(operation, edit), None)
            .await?;
        self.enqueue(&resource, operation)?;
        Ok(resource)
    }

    fn enqueue(&self, resource: &Resource, operation: Operation) -> Result<()> {
        tracing::info!(
            server_id = %resource.server_id,
            resource_id = %resource.id,
            %operation,
            resource = %resource.spec.label(),
            "Resource operation queued"
        );
        self.queue.enqueue(Job::Resource {
            resource_id: resource.id,
            operation,
        })
    }
}

fn unchanged() -> Mutation<Resource> {
    Box::new(|_| Ok(()))
}

/// Repeats the protected and status checks under the store's lock, so a
/// concurrent request cannot slip in between the check and the write.
fn transition(operation: Operation, edit: Mutation<Resource>) -> Mutation<Resource> {
    Box::new(move |r| {
        guard::check_protected(r, operation)?;
        r.lifecycle.apply(operation)?;
        edit(r)?;
        r.touch();
        Ok(())
    })
}

fn rejection(resource: &Resource, operation: Operation) -> TransitionError {
    TransitionError {
        operation,
        status: resource.lifecycle.status,
        update_status: resource.lifecycle.update_status,
    }
}

fn require_pausable(resource: &Resource) -> Result<()> {
    if resource.spec.inactive_status().is_some() {
        Ok(())
    } else {
        Err(HostwrightError::conflict(format!(
            "A {} cannot be disabled or enabled.",
            resource.category()
        )))
    }
}
