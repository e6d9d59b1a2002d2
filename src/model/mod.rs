//! Domain records owned by the orchestration core.

mod deployment;
mod ids;
mod resource;
mod server;
mod site;

pub use deployment::{CommitInfo, Deployment, DeploymentStatus, DeploymentView};
pub use ids::{DeploymentId, ResourceId, ServerId, SiteId};
pub use resource::{
    Category, DatabaseEngine, CacheEngine, FirewallAction, Protocol, Resource, ResourceSpec,
    RuntimeFamily,
};
pub use server::{
    ConnectionStatus, ProvisionStatus, Server, ServerEvent, ServerEventKind, ServerStack,
};
pub use site::{default_shared_paths, Repository, SharedPath, SharedPathKind, Site};
