//! Resource job: runs one lifecycle operation of one resource on its host.

use crate::error::{HostwrightError, Result};
use crate::guard;
use crate::installer::{self, BuildContext};
use crate::model::{Category, Resource, ResourceId, ServerEventKind, ServerId};
use crate::status::{Operation, TaskStatus, TransitionError};
use crate::store::{DefaultClaim, Mutation};

use super::{classify, JobContext};

/// Runs `operation` on the resource. Errors never reach the worker: a
/// failing command is recorded on the resource, anything else is logged.
pub async fn run_resource_job(ctx: &JobContext, resource_id: ResourceId, operation: Operation) {
    match run(ctx, resource_id, operation).await {
        Ok(()) => {}
        Err(HostwrightError::Transition(e)) => {
            tracing::info!(%resource_id, %operation, reason = %e, "Resource job discarded");
        }
        Err(HostwrightError::NotFound { entity, id }) => {
            tracing::info!(%resource_id, %operation, entity, %id, "Resource job target is gone");
        }
        Err(e) => {
            tracing::error!(%resource_id, %operation, error = %e, "Resource job aborted");
        }
    }
}

/// Rejects the write when the job no longer owns the resource.
fn ensure_running(resource: &Resource, operation: Operation) -> Result<()> {
    if resource.lifecycle.still_running(operation) {
        Ok(())
    } else {
        Err(TransitionError {
            operation,
            status: resource.lifecycle.status,
            update_status: resource.lifecycle.update_status,
        }
        .into())
    }
}

async fn run(ctx: &JobContext, resource_id: ResourceId, operation: Operation) -> Result<()> {
    // Checkpoint: a cancelled or already-claimed request fails here and the
    // job exits without touching the host.
    let resource = ctx
        .store
        .update_resource(
            resource_id,
            Box::new(move |r| Ok(r.lifecycle.begin(operation)?)),
            None,
        )
        .await?;

    let server = ctx.store.server(resource.server_id).await?;
    let siblings: Vec<Resource> = ctx
        .store
        .resources(server.id)
        .await?
        .into_iter()
        .filter(|r| r.id != resource.id)
        .collect();

    if operation == Operation::Install {
        if let Err(errors) = guard::check_install(&resource.spec, &siblings) {
            return fail(ctx, &resource, operation, errors.to_string()).await;
        }
    }

    if matches!(operation, Operation::Remove | Operation::Disable) {
        let sites = ctx.store.sites(server.id).await?;
        if let Err(errors) = guard::check_dependents(&resource, operation, &siblings, &sites) {
            return fail(ctx, &resource, operation, errors.to_string()).await;
        }
    }

    let build = BuildContext::new(&server, &siblings);
    let commands = match installer::build(operation, &resource, &build) {
        Ok(commands) => commands,
        Err(e) => return fail(ctx, &resource, operation, e.to_string()).await,
    };

    tracing::info!(
        server_id = %server.id,
        %resource_id,
        %operation,
        resource = %resource.spec.label(),
        commands = commands.len(),
        "Running resource job"
    );

    let execution = ctx.transport.execute(&server, &commands).await;
    if !execution.success() {
        let log = classify::error_log(Some(&resource.spec), &execution);
        return fail(ctx, &resource, operation, log).await;
    }

    finish(ctx, &resource, operation, &siblings).await
}

async fn finish(
    ctx: &JobContext,
    resource: &Resource,
    operation: Operation,
    siblings: &[Resource],
) -> Result<()> {
    let label = resource.spec.label();

    if operation == Operation::Remove {
        let current = ctx.store.resource(resource.id).await?;
        ensure_running(&current, operation)?;
        ctx.store.delete_resource(resource.id).await?;

        // Managed schemas and users go with their engine.
        if resource.category() == Category::DatabaseEngine {
            for managed in siblings.iter().filter(|r| {
                r.protected && matches!(r.category(), Category::Database | Category::DatabaseUser)
            }) {
                ctx.store.delete_resource(managed.id).await?;
            }
        }

        tracing::info!(resource_id = %resource.id, resource = %label, "Resource removed");
        return record_event(ctx, resource.server_id, format!("Removed {}.", label)).await;
    }

    let claim = match operation {
        Operation::Install if resource.spec.runtime_family().is_some() => {
            Some(DefaultClaim::IfVacant)
        }
        Operation::MakeCliDefault => Some(DefaultClaim::TakeCli),
        _ => None,
    };

    let mutation: Mutation<Resource> = Box::new(move |r| {
        ensure_running(r, operation)?;
        match operation {
            Operation::Update => {
                if let Some(target) = r.pending_spec.take() {
                    r.spec = target;
                }
                r.lifecycle.finish_update();
            }
            Operation::Disable => {
                let inactive = r.spec.inactive_status().unwrap_or(TaskStatus::Disabled);
                r.lifecycle.settle(inactive);
            }
            _ => r.lifecycle.settle(TaskStatus::Active),
        }
        Ok(())
    });
    let updated = ctx.store.update_resource(resource.id, mutation, claim).await?;

    tracing::info!(
        resource_id = %updated.id,
        %operation,
        resource = %updated.spec.label(),
        status = %updated.status(),
        "Resource job finished"
    );

    let message = match operation {
        Operation::Install => format!("Installed {}.", label),
        Operation::Update => format!("Updated {}.", updated.spec.label()),
        Operation::Disable => format!("Disabled {}.", label),
        Operation::Enable => format!("Enabled {}.", label),
        Operation::MakeCliDefault => format!("{} is now the CLI default.", label),
        _ => format!("{} finished for {}.", operation, label),
    };
    record_event(ctx, resource.server_id, message).await
}

async fn fail(ctx: &JobContext, resource: &Resource, operation: Operation, log: String) -> Result<()> {
    tracing::warn!(
        server_id = %resource.server_id,
        resource_id = %resource.id,
        %operation,
        hint = %log.lines().next().unwrap_or_default(),
        "Resource job failed"
    );

    ctx.store
        .update_resource(
            resource.id,
            Box::new(move |r| {
                ensure_running(r, operation)?;
                r.lifecycle.fail(operation, log);
                Ok(())
            }),
            None,
        )
        .await?;

    let message = format!("Failed to {} {}.", operation, resource.spec.label());
    record_event(ctx, resource.server_id, message).await
}

async fn record_event(ctx: &JobContext, server_id: ServerId, message: String) -> Result<()> {
    ctx.store
        .update_server(
            server_id,
            Box::new(move |server| {
                server.record_event(ServerEventKind::Resource, message);
                server.touch();
                Ok(())
            }),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::AppConfig;
    use crate::model::{
        CacheEngine, ConnectionStatus, DatabaseEngine, Repository, ResourceSpec, Server,
        ServerStack, Site,
    };
    use crate::store::{no_check, MemoryStore, Store};
    use crate::transport::RecordingTransport;

    struct Harness {
        ctx: JobContext,
        store: Arc<MemoryStore>,
        transport: RecordingTransport,
        server_id: ServerId,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let transport = RecordingTransport::new();
        let mut server = Server::new("web-1", "203.0.113.10", 22, "root", ServerStack::default());
        server.connection_status = ConnectionStatus::Connected;
        let server_id = server.id;
        store.insert_server(server).await.unwrap();

        let ctx = JobContext::new(
            store.clone(),
            Arc::new(transport.clone()),
            Arc::new(AppConfig::default()),
        );
        Harness {
            ctx,
            store,
            transport,
            server_id,
        }
    }

    impl Harness {
        async fn insert(&self, resource: Resource) -> ResourceId {
            let id = resource.id;
            self.store
                .insert_resource(resource, no_check(), None)
                .await
                .unwrap();
            id
        }

        async fn request(&self, id: ResourceId, operation: Operation) {
            self.store
                .update_resource(
                    id,
                    Box::new(move |r| {
                        r.lifecycle.apply(operation)?;
                        Ok(())
                    }),
                    None,
                )
                .await
                .unwrap();
        }

        fn php(&self, version: &str) -> Resource {
            Resource::new(
                self.server_id,
                ResourceSpec::PhpRuntime {
                    version: version.to_string(),
                },
            )
        }

        fn redis(&self) -> Resource {
            Resource::provisioned(
                self.server_id,
                ResourceSpec::Cache {
                    engine: CacheEngine::Redis,
                    port: 6379,
                },
            )
        }
    }

    #[tokio::test]
    async fn test_first_runtime_install_claims_defaults() {
        let h = harness().await;
        let first = h.insert(h.php("8.3")).await;
        let second = h.insert(h.php("8.2")).await;

        run_resource_job(&h.ctx, first, Operation::Install).await;
        run_resource_job(&h.ctx, second, Operation::Install).await;

        let first = h.store.resource(first).await.unwrap();
        let second = h.store.resource(second).await.unwrap();
        assert_eq!(first.status(), TaskStatus::Active);
        assert!(first.is_cli_default && first.is_site_default);
        assert_eq!(second.status(), TaskStatus::Active);
        assert!(!second.is_cli_default && !second.is_site_default);
        assert!(h.transport.transcript().contains("php8.2-fpm"));
    }

    #[tokio::test]
    async fn test_failed_install_records_classified_log() {
        let h = harness().await;
        h.transport
            .fail_when("apt-get", 100, "E: Could not get lock /var/lib/dpkg/lock-frontend");
        let id = h.insert(h.php("8.3")).await;

        run_resource_job(&h.ctx, id, Operation::Install).await;

        let resource = h.store.resource(id).await.unwrap();
        assert_eq!(resource.status(), TaskStatus::Failed);
        let log = resource.lifecycle.error_log.unwrap();
        assert!(log.contains("package manager"));
        assert!(log.ends_with("E: Could not get lock /var/lib/dpkg/lock-frontend"));
        assert!(!resource.is_cli_default);

        let server = h.store.server(h.server_id).await.unwrap();
        assert!(server.events.last().unwrap().message.starts_with("Failed to install"));
    }

    #[tokio::test]
    async fn test_install_fails_when_guard_no_longer_passes() {
        let h = harness().await;
        h.insert(Resource::provisioned(
            h.server_id,
            ResourceSpec::DatabaseEngine {
                engine: DatabaseEngine::Mysql,
                version: "8.0".to_string(),
                port: 3306,
            },
        ))
        .await;
        let id = h
            .insert(Resource::new(
                h.server_id,
                ResourceSpec::DatabaseEngine {
                    engine: DatabaseEngine::Postgresql,
                    version: "16".to_string(),
                    port: 5432,
                },
            ))
            .await;

        run_resource_job(&h.ctx, id, Operation::Install).await;

        let resource = h.store.resource(id).await.unwrap();
        assert_eq!(resource.status(), TaskStatus::Failed);
        assert!(resource.lifecycle.error_log.unwrap().contains("already installed"));
        assert!(h.transport.commands().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_update_is_discarded_before_running() {
        let h = harness().await;
        let id = h.insert(h.redis()).await;
        h.request(id, Operation::Update).await;
        h.request(id, Operation::CancelUpdate).await;

        run_resource_job(&h.ctx, id, Operation::Update).await;

        assert!(h.transport.commands().is_empty());
        let resource = h.store.resource(id).await.unwrap();
        assert_eq!(resource.status(), TaskStatus::Active);
        assert_eq!(resource.lifecycle.update_status, None);
    }

    #[tokio::test]
    async fn test_update_applies_pending_spec() {
        let h = harness().await;
        let id = h.insert(h.redis()).await;
        h.store
            .update_resource(
                id,
                Box::new(|r| {
                    r.lifecycle.apply(Operation::Update)?;
                    r.pending_spec = Some(ResourceSpec::Cache {
                        engine: CacheEngine::Redis,
                        port: 6380,
                    });
                    Ok(())
                }),
                None,
            )
            .await
            .unwrap();

        run_resource_job(&h.ctx, id, Operation::Update).await;

        let resource = h.store.resource(id).await.unwrap();
        assert_eq!(resource.spec.listening_port(), Some(6380));
        assert!(resource.pending_spec.is_none());
        assert_eq!(resource.lifecycle.update_status, None);
    }

    #[tokio::test]
    async fn test_failed_update_keeps_resource_active() {
        let h = harness().await;
        h.transport.fail_when("systemctl restart", 1, "Job failed");
        let id = h.insert(h.redis()).await;
        h.request(id, Operation::Update).await;

        run_resource_job(&h.ctx, id, Operation::Update).await;

        let resource = h.store.resource(id).await.unwrap();
        assert_eq!(resource.status(), TaskStatus::Active);
        assert_eq!(resource.lifecycle.update_status, Some(TaskStatus::Failed));
        assert!(resource.lifecycle.update_error_log.is_some());
    }

    #[tokio::test]
    async fn test_remove_leaves_unrelated_resources() {
        let h = harness().await;
        let redis = h.insert(h.redis()).await;
        let nginx = h
            .insert(Resource::provisioned(
                h.server_id,
                ResourceSpec::ReverseProxy { port: 80 },
            ))
            .await;
        h.request(redis, Operation::Remove).await;

        run_resource_job(&h.ctx, redis, Operation::Remove).await;

        assert!(h.store.resource(redis).await.is_err());
        assert_eq!(
            h.store.resource(nginx).await.unwrap().status(),
            TaskStatus::Active
        );
    }

    #[tokio::test]
    async fn test_failed_remove_reverts_status() {
        let h = harness().await;
        h.transport.fail_when("purge", 1, "E: Permission denied");
        let id = h.insert(h.redis()).await;
        h.request(id, Operation::Remove).await;

        run_resource_job(&h.ctx, id, Operation::Remove).await;

        let resource = h.store.resource(id).await.unwrap();
        assert_eq!(resource.status(), TaskStatus::Active);
        assert!(resource.lifecycle.error_log.unwrap().contains("Permission denied"));
    }

    #[tokio::test]
    async fn test_remove_rechecks_dependents_at_run_time() {
        let h = harness().await;
        h.insert(Resource::provisioned(
            h.server_id,
            ResourceSpec::DatabaseEngine {
                engine: DatabaseEngine::Mysql,
                version: "8.0".to_string(),
                port: 3306,
            },
        ))
        .await;
        let schema = h
            .insert(Resource::provisioned(
                h.server_id,
                ResourceSpec::Database {
                    name: "shop".to_string(),
                    charset: "utf8mb4".to_string(),
                },
            ))
            .await;
        h.request(schema, Operation::Remove).await;

        // A site starts using the database after the request was accepted.
        let mut site = Site::new(h.server_id, "shop.example.com");
        site.database_id = Some(schema);
        site.repository = Some(Repository {
            url: "git@github.com:acme/shop.git".to_string(),
            full_name: "acme/shop".to_string(),
            branch: "main".to_string(),
        });
        h.store.insert_site(site).await.unwrap();

        run_resource_job(&h.ctx, schema, Operation::Remove).await;

        assert!(h.transport.commands().is_empty());
        let resource = h.store.resource(schema).await.unwrap();
        assert_eq!(resource.status(), TaskStatus::Active);
        assert!(resource
            .lifecycle
            .error_log
            .unwrap()
            .contains("1 site currently depends on this database: shop.example.com."));
    }

    #[tokio::test]
    async fn test_make_cli_default_moves_flag() {
        let h = harness().await;
        let mut old = h.php("8.2");
        old.lifecycle = crate::status::Lifecycle::active();
        old.is_cli_default = true;
        old.is_site_default = true;
        let old = h.insert(old).await;

        let mut new = h.php("8.3");
        new.lifecycle = crate::status::Lifecycle::active();
        let new = h.insert(new).await;
        h.request(new, Operation::MakeCliDefault).await;

        run_resource_job(&h.ctx, new, Operation::MakeCliDefault).await;

        let old = h.store.resource(old).await.unwrap();
        let new = h.store.resource(new).await.unwrap();
        assert!(new.is_cli_default);
        assert_eq!(new.status(), TaskStatus::Active);
        assert!(!old.is_cli_default);
        assert!(old.is_site_default);
        assert!(h.transport.transcript().contains("update-alternatives"));
    }

    #[tokio::test]
    async fn test_disable_supervisor_task_pauses_it() {
        let h = harness().await;
        let id = h
            .insert(Resource::provisioned(
                h.server_id,
                ResourceSpec::SupervisorTask {
                    command: "php artisan queue:work".to_string(),
                    user: "hostwright".to_string(),
                    processes: 1,
                    working_directory: None,
                },
            ))
            .await;
        h.request(id, Operation::Disable).await;

        run_resource_job(&h.ctx, id, Operation::Disable).await;

        assert_eq!(
            h.store.resource(id).await.unwrap().status(),
            TaskStatus::Paused
        );
    }
}
