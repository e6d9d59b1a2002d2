//! In-memory store used by the server binary and by tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DefaultClaim, InsertCheck, Mutation, SiblingCheck, Store, StoreError};
use crate::error::{HostwrightError, Result};
use crate::model::{
    Deployment, DeploymentId, Resource, ResourceId, Server, ServerId, Site, SiteId,
};

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    servers: HashMap<ServerId, Server>,
    resources: HashMap<ResourceId, Resource>,
    sites: HashMap<SiteId, Site>,
    deployments: HashMap<DeploymentId, Deployment>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Resolves a default-flag claim for `target` against its siblings.
fn apply_claim(
    resources: &mut HashMap<ResourceId, Resource>,
    target: &mut Resource,
    claim: DefaultClaim,
) {
    let Some(family) = target.spec.runtime_family() else {
        return;
    };
    let siblings = resources.values_mut().filter(|r| {
        r.server_id == target.server_id
            && r.id != target.id
            && r.spec.runtime_family() == Some(family)
    });

    match claim {
        DefaultClaim::IfVacant => {
            let (mut cli_taken, mut site_taken) = (false, false);
            for sibling in siblings {
                cli_taken |= sibling.is_cli_default;
                site_taken |= sibling.is_site_default;
            }
            target.is_cli_default |= !cli_taken;
            target.is_site_default |= !site_taken;
        }
        DefaultClaim::TakeCli => {
            for sibling in siblings.filter(|s| s.is_cli_default) {
                sibling.is_cli_default = false;
                sibling.touch();
            }
            target.is_cli_default = true;
        }
    }
}

fn mutate<K, T>(
    map: &mut HashMap<K, T>,
    key: K,
    entity: &'static str,
    mutation: Mutation<T>,
) -> Result<T>
where
    K: std::hash::Hash + Eq + std::fmt::Display,
    T: Clone,
{
    let mut record = map
        .get(&key)
        .cloned()
        .ok_or_else(|| HostwrightError::not_found(entity, &key))?;
    mutation(&mut record)?;
    map.insert(key, record.clone());
    Ok(record)
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_server(&self, server: Server) -> Result<()> {
        let mut state = self.state.write().await;
        if state.servers.contains_key(&server.id) {
            return Err(StoreError::Duplicate {
                entity: "server",
                id: server.id.to_string(),
            }
            .into());
        }
        state.servers.insert(server.id, server);
        Ok(())
    }

    async fn server(&self, id: ServerId) -> Result<Server> {
        let state = self.state.read().await;
        state
            .servers
            .get(&id)
            .cloned()
            .ok_or_else(|| HostwrightError::not_found("server", id))
    }

    async fn servers(&self) -> Result<Vec<Server>> {
        let state = self.state.read().await;
        let mut servers: Vec<Server> = state.servers.values().cloned().collect();
        servers.sort_by_key(|s| s.created_at);
        Ok(servers)
    }

    async fn update_server(&self, id: ServerId, mutation: Mutation<Server>) -> Result<Server> {
        let mut state = self.state.write().await;
        let mut server = mutate(&mut state.servers, id, "server", mutation)?;
        server.touch();
        state.servers.insert(id, server.clone());
        Ok(server)
    }

    async fn resource(&self, id: ResourceId) -> Result<Resource> {
        let state = self.state.read().await;
        state
            .resources
            .get(&id)
            .cloned()
            .ok_or_else(|| HostwrightError::not_found("resource", id))
    }

    async fn resources(&self, server_id: ServerId) -> Result<Vec<Resource>> {
        let state = self.state.read().await;
        let mut resources: Vec<Resource> = state
            .resources
            .values()
            .filter(|r| r.server_id == server_id)
            .cloned()
            .collect();
        resources.sort_by_key(|r| r.created_at);
        Ok(resources)
    }

    async fn insert_resource(
        &self,
        mut resource: Resource,
        check: InsertCheck,
        claim: Option<DefaultClaim>,
    ) -> Result<Resource> {
        let mut state = self.state.write().await;
        if !state.servers.contains_key(&resource.server_id) {
            return Err(HostwrightError::not_found("server", resource.server_id));
        }
        if state.resources.contains_key(&resource.id) {
            return Err(StoreError::Duplicate {
                entity: "resource",
                id: resource.id.to_string(),
            }
            .into());
        }

        let siblings: Vec<Resource> = state
            .resources
            .values()
            .filter(|r| r.server_id == resource.server_id)
            .cloned()
            .collect();
        check(&siblings)?;

        if let Some(claim) = claim {
            apply_claim(&mut state.resources, &mut resource, claim);
        }
        state.resources.insert(resource.id, resource.clone());
        Ok(resource)
    }

    async fn update_resource(
        &self,
        id: ResourceId,
        mutation: Mutation<Resource>,
        claim: Option<DefaultClaim>,
    ) -> Result<Resource> {
        let mut state = self.state.write().await;
        let mut resource = state
            .resources
            .get(&id)
            .cloned()
            .ok_or_else(|| HostwrightError::not_found("resource", id))?;
        mutation(&mut resource)?;
        if let Some(claim) = claim {
            apply_claim(&mut state.resources, &mut resource, claim);
        }
        resource.touch();
        state.resources.insert(id, resource.clone());
        Ok(resource)
    }

    async fn update_resource_checked(
        &self,
        id: ResourceId,
        mutation: Mutation<Resource>,
        check: SiblingCheck,
    ) -> Result<Resource> {
        let mut state = self.state.write().await;
        let mut resource = state
            .resources
            .get(&id)
            .cloned()
            .ok_or_else(|| HostwrightError::not_found("resource", id))?;
        mutation(&mut resource)?;

        let siblings: Vec<Resource> = state
            .resources
            .values()
            .filter(|r| r.server_id == resource.server_id && r.id != id)
            .cloned()
            .collect();
        check(&resource, &siblings)?;

        resource.touch();
        state.resources.insert(id, resource.clone());
        Ok(resource)
    }

    async fn delete_resource(&self, id: ResourceId) -> Result<()> {
        let mut state = self.state.write().await;
        state
            .resources
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| HostwrightError::not_found("resource", id))
    }

    async fn clear_resources(&self, server_id: ServerId) -> Result<usize> {
        let mut state = self.state.write().await;
        let before = state.resources.len();
        state.resources.retain(|_, r| r.server_id != server_id);
        Ok(before - state.resources.len())
    }

    async fn insert_site(&self, site: Site) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.servers.contains_key(&site.server_id) {
            return Err(HostwrightError::not_found("server", site.server_id));
        }
        state.sites.insert(site.id, site);
        Ok(())
    }

    async fn site(&self, id: SiteId) -> Result<Site> {
        let state = self.state.read().await;
        state
            .sites
            .get(&id)
            .cloned()
            .ok_or_else(|| HostwrightError::not_found("site", id))
    }

    async fn sites(&self, server_id: ServerId) -> Result<Vec<Site>> {
        let state = self.state.read().await;
        let mut sites: Vec<Site> = state
            .sites
            .values()
            .filter(|s| s.server_id == server_id)
            .cloned()
            .collect();
        sites.sort_by(|a, b| a.domain.cmp(&b.domain));
        Ok(sites)
    }

    async fn update_site(&self, id: SiteId, mutation: Mutation<Site>) -> Result<Site> {
        let mut state = self.state.write().await;
        mutate(&mut state.sites, id, "site", mutation)
    }

    async fn insert_deployment(&self, deployment: Deployment) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.sites.contains_key(&deployment.site_id) {
            return Err(HostwrightError::not_found("site", deployment.site_id));
        }
        state.deployments.insert(deployment.id, deployment);
        Ok(())
    }

    async fn deployment(&self, id: DeploymentId) -> Result<Deployment> {
        let state = self.state.read().await;
        state
            .deployments
            .get(&id)
            .cloned()
            .ok_or_else(|| HostwrightError::not_found("deployment", id))
    }

    async fn deployments(&self, site_id: SiteId) -> Result<Vec<Deployment>> {
        let state = self.state.read().await;
        let mut deployments: Vec<Deployment> = state
            .deployments
            .values()
            .filter(|d| d.site_id == site_id)
            .cloned()
            .collect();
        deployments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deployments)
    }

    async fn update_deployment(
        &self,
        id: DeploymentId,
        mutation: Mutation<Deployment>,
    ) -> Result<Deployment> {
        let mut state = self.state.write().await;
        mutate(&mut state.deployments, id, "deployment", mutation)
    }
}
