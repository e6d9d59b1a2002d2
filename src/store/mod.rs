//! Persistence seam.
//!
//! Every method is one atomic operation: mutations run against a copy of
//! the record and are written back only when they return `Ok`, and checks
//! passed to [`Store::insert_resource`] and
//! [`Store::update_resource_checked`] see the server's resources under the
//! same lock as the write.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::Result;
use crate::model::{
    Deployment, DeploymentId, Resource, ResourceId, Server, ServerId, Site, SiteId,
};

/// Closure applied to a stored record inside one persistence operation.
pub type Mutation<T> = Box<dyn FnOnce(&mut T) -> Result<()> + Send>;

/// Check run against the server's current resources before an insert.
pub type InsertCheck = Box<dyn FnOnce(&[Resource]) -> Result<()> + Send>;

/// Check run against a mutated resource and its server's other resources.
pub type SiblingCheck = Box<dyn FnOnce(&Resource, &[Resource]) -> Result<()> + Send>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{entity} already exists: {id}")]
    Duplicate { entity: &'static str, id: String },

    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// How a runtime write claims the server's default flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultClaim {
    /// Take each default flag no sibling of the same family holds.
    IfVacant,
    /// Take the CLI default away from every sibling of the same family.
    TakeCli,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn insert_server(&self, server: Server) -> Result<()>;

    async fn server(&self, id: ServerId) -> Result<Server>;

    async fn servers(&self) -> Result<Vec<Server>>;

    async fn update_server(&self, id: ServerId, mutation: Mutation<Server>) -> Result<Server>;

    async fn resource(&self, id: ResourceId) -> Result<Resource>;

    async fn resources(&self, server_id: ServerId) -> Result<Vec<Resource>>;

    async fn insert_resource(
        &self,
        resource: Resource,
        check: InsertCheck,
        claim: Option<DefaultClaim>,
    ) -> Result<Resource>;

    async fn update_resource(
        &self,
        id: ResourceId,
        mutation: Mutation<Resource>,
        claim: Option<DefaultClaim>,
    ) -> Result<Resource>;

    /// Like [`Store::update_resource`], with `check` seeing the mutated
    /// record and its siblings before anything is written.
    async fn update_resource_checked(
        &self,
        id: ResourceId,
        mutation: Mutation<Resource>,
        check: SiblingCheck,
    ) -> Result<Resource>;

    async fn delete_resource(&self, id: ResourceId) -> Result<()>;

    /// Deletes every resource of a server, returning how many went.
    async fn clear_resources(&self, server_id: ServerId) -> Result<usize>;

    async fn insert_site(&self, site: Site) -> Result<()>;

    async fn site(&self, id: SiteId) -> Result<Site>;

    async fn sites(&self, server_id: ServerId) -> Result<Vec<Site>>;

    async fn update_site(&self, id: SiteId, mutation: Mutation<Site>) -> Result<Site>;

    async fn insert_deployment(&self, deployment: Deployment) -> Result<()>;

    async fn deployment(&self, id: DeploymentId) -> Result<Deployment>;

    /// Deployments of a site, newest first.
    async fn deployments(&self, site_id: SiteId) -> Result<Vec<Deployment>>;

    async fn update_deployment(
        &self,
        id: DeploymentId,
        mutation: Mutation<Deployment>,
    ) -> Result<Deployment>;
}

/// An [`InsertCheck`] that accepts everything.
pub fn no_check() -> InsertCheck {
    Box::new(|_| Ok(()))
}
