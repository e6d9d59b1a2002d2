//! Deployment triggers and the deployment job.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use super::pipeline::{self, PastRelease, PipelineSettings};
use super::webhook::{self, PushEvent};
use crate::error::{HostwrightError, Result, ValidationErrors};
use crate::job::{classify, Job, JobContext, JobQueue};
use crate::model::{
    CommitInfo, Deployment, DeploymentId, DeploymentStatus, DeploymentView, Site, SiteId,
};
use crate::store::Store;
use crate::utils::{format_duration, release_name, truncate};

/// What a webhook delivery led to.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Pong,
    Deployed { deployment: DeploymentView },
    Ignored { reason: String },
}

#[derive(Clone)]
pub struct Deployer {
    store: Arc<dyn Store>,
    queue: JobQueue,
}

impl Deployer {
    pub fn new(store: Arc<dyn Store>, queue: JobQueue) -> Self {
        Self { store, queue }
    }

    /// Adds a site to a server. Domains are unique per server.
    pub async fn add_site(&self, site: Site) -> Result<Site> {
        self.store.server(site.server_id).await?;

        let mut errors = match pipeline::validate_site(&site) {
            Ok(()) => ValidationErrors::new(),
            Err(errors) => errors,
        };
        let domain = site.domain.as_str();
        if domain.is_empty() || domain.contains(|c: char| c.is_whitespace() || c == '/') {
            errors.add("domain", format!("\"{}\" is not a valid domain.", domain));
        }
        let taken = self
            .store
            .sites(site.server_id)
            .await?
            .iter()
            .any(|s| s.domain.eq_ignore_ascii_case(domain));
        if taken {
            errors.add("domain", format!("{} is already on this server.", domain));
        }
        errors.into_result()?;

        self.store.insert_site(site.clone()).await?;
        tracing::info!(server_id = %site.server_id, site_id = %site.id, domain = %site.domain, "Site added");
        Ok(site)
    }

    /// Records a `Pending` deployment and queues it. Sites without a git
    /// repository are rejected before any record exists.
    pub async fn trigger(&self, site_id: SiteId, commit: CommitInfo) -> Result<Deployment> {
        let site = self.store.site(site_id).await?;
        let deployment = Deployment::for_site(&site, commit).ok_or_else(|| {
            ValidationErrors::single(
                "repository",
                format!("{} has no git repository to deploy.", site.domain),
            )
        })?;

        self.store.insert_deployment(deployment.clone()).await?;
        self.queue.enqueue(Job::Deploy {
            deployment_id: deployment.id,
        })?;

        tracing::info!(
            %site_id,
            deployment_id = %deployment.id,
            branch = %deployment.branch,
            commit = deployment.commit_sha.as_deref().unwrap_or("HEAD"),
            "Deployment queued"
        );
        Ok(deployment)
    }

    pub async fn status(&self, deployment_id: DeploymentId) -> Result<DeploymentView> {
        Ok(self.store.deployment(deployment_id).await?.view())
    }

    /// Handles one webhook delivery for a site.
    pub async fn handle_webhook(
        &self,
        site_id: SiteId,
        event: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookOutcome> {
        let site = self.store.site(site_id).await?;
        webhook::verify_signature(&site.webhook_secret, body, signature)?;

        match event.unwrap_or("push") {
            "ping" => return Ok(WebhookOutcome::Pong),
            "push" => {}
            other => {
                return Ok(WebhookOutcome::Ignored {
                    reason: format!("{} events do not deploy", other),
                })
            }
        }

        let push = webhook::parse_push(body)?;
        if let Some(reason) = skip_reason(&site, &push) {
            tracing::debug!(%site_id, %reason, "Webhook push ignored");
            return Ok(WebhookOutcome::Ignored { reason });
        }

        let deployment = self
            .trigger(
                site_id,
                CommitInfo {
                    commit_sha: push.commit_sha,
                    author: push.author,
                    message: push.message,
                },
            )
            .await?;
        Ok(WebhookOutcome::Deployed {
            deployment: deployment.view(),
        })
    }
}

fn skip_reason(site: &Site, push: &PushEvent) -> Option<String> {
    let Some(repository) = &site.repository else {
        return Some("site has no repository".to_string());
    };
    if !site.auto_deploy {
        return Some("auto-deploy is off".to_string());
    }
    if !repository.full_name.eq_ignore_ascii_case(&push.repository) {
        return Some(format!("push is for {}", push.repository));
    }
    match &push.branch {
        Some(branch) if *branch == repository.branch => None,
        Some(branch) => Some(format!("push is for branch {}", branch)),
        None => Some("push is not for a branch".to_string()),
    }
}

/// Runs one deployment. Only a `Pending` record is picked up, and only one
/// deployment per site runs at a time: a deployment finding its site busy
/// stays `Pending` and is picked up by the running one once it finishes.
pub async fn run_deployment(ctx: &JobContext, deployment_id: DeploymentId) {
    let mut next = Some(deployment_id);
    while let Some(deployment_id) = next.take() {
        let site_id = match claim_site(ctx, deployment_id).await {
            Ok(site_id) => site_id,
            Err(HostwrightError::StateConflict(reason)) => {
                tracing::info!(%deployment_id, %reason, "Deployment waits for the site");
                return;
            }
            Err(e) => {
                tracing::error!(%deployment_id, error = %e, "Deployment job aborted");
                return;
            }
        };

        execute(ctx, deployment_id).await;

        match release_site(ctx, site_id, deployment_id).await {
            Ok(pending) => next = pending,
            Err(e) => {
                tracing::error!(%site_id, %deployment_id, error = %e, "Could not release site");
            }
        }
    }
}

/// Marks the site busy with this deployment.
async fn claim_site(ctx: &JobContext, deployment_id: DeploymentId) -> Result<SiteId> {
    let site_id = ctx.store.deployment(deployment_id).await?.site_id;
    ctx.store
        .update_site(
            site_id,
            Box::new(move |site| {
                if let Some(running) = site.active_deployment {
                    return Err(HostwrightError::conflict(format!(
                        "{} is busy with deployment {}",
                        site.domain, running
                    )));
                }
                site.active_deployment = Some(deployment_id);
                Ok(())
            }),
        )
        .await?;
    Ok(site_id)
}

/// Frees the site and returns its oldest deployment still waiting.
async fn release_site(
    ctx: &JobContext,
    site_id: SiteId,
    deployment_id: DeploymentId,
) -> Result<Option<DeploymentId>> {
    ctx.store
        .update_site(
            site_id,
            Box::new(move |site| {
                if site.active_deployment == Some(deployment_id) {
                    site.active_deployment = None;
                }
                Ok(())
            }),
        )
        .await?;

    Ok(ctx
        .store
        .deployments(site_id)
        .await?
        .into_iter()
        .filter(|d| d.status == DeploymentStatus::Pending)
        .last()
        .map(|d| d.id))
}

async fn execute(ctx: &JobContext, deployment_id: DeploymentId) {
    match run(ctx, deployment_id).await {
        Ok(()) => {}
        Err(HostwrightError::StateConflict(reason)) => {
            tracing::info!(%deployment_id, %reason, "Deployment job discarded");
        }
        Err(e) => {
            tracing::error!(%deployment_id, error = %e, "Deployment job aborted");
            let message = e.to_string();
            let recorded = ctx
                .store
                .update_deployment(
                    deployment_id,
                    Box::new(move |d| {
                        if d.is_running() {
                            d.status = DeploymentStatus::Failed;
                            d.error_output = message;
                            d.finished_at = Some(Utc::now());
                        }
                        Ok(())
                    }),
                )
                .await;
            if let Err(e) = recorded {
                tracing::error!(%deployment_id, error = %e, "Could not record deployment failure");
            }
        }
    }
}

async fn run(ctx: &JobContext, deployment_id: DeploymentId) -> Result<()> {
    let site_id = ctx.store.deployment(deployment_id).await?.site_id;
    let history = ctx.store.deployments(site_id).await?;
    let latest = history.iter().filter_map(|d| d.release.as_deref()).max();
    let started_at = Utc::now();
    let release = release_name(started_at, latest);
    let past_releases: Vec<PastRelease> = history
        .iter()
        .filter(|d| d.id != deployment_id && !d.is_running())
        .filter_map(|d| {
            d.release.clone().map(|name| PastRelease {
                name,
                live: d.status == DeploymentStatus::Success,
            })
        })
        .collect();
    let deployment = {
        let release = release.clone();
        ctx.store
            .update_deployment(
                deployment_id,
                Box::new(move |d| {
                    if d.status != DeploymentStatus::Pending {
                        return Err(HostwrightError::conflict(format!(
                            "deployment is already {:?}",
                            d.status
                        )));
                    }
                    d.status = DeploymentStatus::Deploying;
                    d.started_at = Some(started_at);
                    d.release = Some(release);
                    Ok(())
                }),
            )
            .await?
    };

    let site = ctx.store.site(deployment.site_id).await?;
    let server = ctx.store.server(site.server_id).await?;
    let plan = pipeline::build(
        &site,
        &deployment,
        &PipelineSettings {
            sites_user: &ctx.config.sites_user,
            keep_releases: ctx.config.keep_releases,
            release: &release,
            past_releases: &past_releases,
        },
    )?;

    tracing::info!(
        %deployment_id,
        site = %site.domain,
        release = %release,
        message = %truncate(deployment.commit_message.as_deref().unwrap_or_default(), 60),
        "Deploying"
    );

    let execution = ctx.transport.execute(&server, &plan.commands).await;
    let success = execution.success();
    let resolved_sha = execution
        .results
        .get(plan.revision_index)
        .filter(|r| r.success())
        .map(|r| r.stdout.trim().to_string())
        .filter(|sha| !sha.is_empty());

    let mut error_output = execution.stderr();
    if let Some(failure) = execution.failure() {
        if let Some(hint) = classify::hint(None, &failure.command, &failure.stderr) {
            error_output = format!("{}\n\n{}", hint, error_output);
        }
    }
    let output = execution.stdout();
    let exit_code = execution.exit_code();
    let finished_at = Utc::now();

    let deployment = ctx
        .store
        .update_deployment(
            deployment_id,
            Box::new(move |d| {
                d.status = if success {
                    DeploymentStatus::Success
                } else {
                    DeploymentStatus::Failed
                };
                d.exit_code = Some(exit_code);
                d.output = output;
                d.error_output = error_output;
                if resolved_sha.is_some() {
                    d.commit_sha = resolved_sha;
                }
                d.finished_at = Some(finished_at);
                Ok(())
            }),
        )
        .await?;

    let took = format_duration(deployment.duration_ms().unwrap_or_default() / 1000);
    if success {
        ctx.store
            .update_site(
                site.id,
                Box::new(move |s| {
                    s.last_deployed_at = Some(finished_at);
                    Ok(())
                }),
            )
            .await?;
        tracing::info!(%deployment_id, site = %site.domain, took = %took, "Deployment succeeded");
    } else {
        tracing::warn!(
            %deployment_id,
            site = %site.domain,
            exit_code,
            took = %took,
            "Deployment failed; the previous release stays active"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::deploy::webhook::tests::{sign, PUSH};
    use crate::job::JobReceiver;
    use crate::model::{Repository, Server, ServerStack};
    use crate::store::MemoryStore;
    use crate::transport::RecordingTransport;

    struct Harness {
        deployer: Deployer,
        ctx: JobContext,
        store: Arc<MemoryStore>,
        transport: RecordingTransport,
        receiver: JobReceiver,
        site: Site,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let transport = RecordingTransport::new();
        let server = Server::new("web-1", "203.0.113.10", 22, "root", ServerStack::default());
        let mut site = Site::new(server.id, "shop.example.com");
        site.repository = Some(Repository {
            url: "git@github.com:acme/shop.git".to_string(),
            full_name: "acme/shop".to_string(),
            branch: "main".to_string(),
        });
        site.php_version = Some("8.3".to_string());
        site.deployment_script = "php artisan optimize".to_string();
        site.auto_deploy = true;
        store.insert_server(server).await.unwrap();
        store.insert_site(site.clone()).await.unwrap();

        let (queue, receiver) = JobQueue::new();
        let ctx = JobContext::new(
            store.clone(),
            Arc::new(transport.clone()),
            Arc::new(AppConfig::default()),
        );
        Harness {
            deployer: Deployer::new(store.clone(), queue),
            ctx,
            store,
            transport,
            receiver,
            site,
        }
    }

    #[tokio::test]
    async fn test_add_site_rejects_duplicate_domain() {
        let h = harness().await;
        let err = h
            .deployer
            .add_site(Site::new(h.site.server_id, "SHOP.example.com"))
            .await
            .unwrap_err();
        match err {
            HostwrightError::Validation(errors) => assert!(errors.get("domain").is_some()),
            other => panic!("unexpected error {:?}", other),
        }

        let site = h
            .deployer
            .add_site(Site::new(h.site.server_id, "blog.example.com"))
            .await
            .unwrap();
        assert_eq!(h.store.site(site.id).await.unwrap().domain, "blog.example.com");
    }

    #[tokio::test]
    async fn test_trigger_without_repository_creates_nothing() {
        let mut h = harness().await;
        let bare = Site::new(h.site.server_id, "static.example.com");
        h.store.insert_site(bare.clone()).await.unwrap();

        let err = h
            .deployer
            .trigger(bare.id, CommitInfo::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HostwrightError::Validation(_)));
        assert!(h.store.deployments(bare.id).await.unwrap().is_empty());
        assert_eq!(h.receiver.try_recv(), None);
    }

    #[tokio::test]
    async fn test_successful_deployment() {
        let mut h = harness().await;
        h.transport.respond_with("rev-parse HEAD", "4b825dc6\n");

        let deployment = h
            .deployer
            .trigger(h.site.id, CommitInfo::default())
            .await
            .unwrap();
        assert_eq!(
            h.deployer.status(deployment.id).await.unwrap().status,
            DeploymentStatus::Pending
        );
        assert_eq!(
            h.receiver.try_recv(),
            Some(Job::Deploy {
                deployment_id: deployment.id
            })
        );

        run_deployment(&h.ctx, deployment.id).await;

        let view = h.deployer.status(deployment.id).await.unwrap();
        assert!(view.is_success);
        assert_eq!(view.exit_code, Some(0));
        assert_eq!(view.commit_sha.as_deref(), Some("4b825dc6"));
        assert!(view.duration_ms.is_some());

        let site = h.store.site(h.site.id).await.unwrap();
        assert!(site.last_deployed_at.is_some());
        assert!(h.transport.transcript().contains("mv -Tf"));
    }

    #[tokio::test]
    async fn test_failed_build_keeps_current_release() {
        let h = harness().await;
        h.transport
            .fail_when("composer install", 1, "Your requirements could not be resolved");

        let deployment = h
            .deployer
            .trigger(h.site.id, CommitInfo::default())
            .await
            .unwrap();
        run_deployment(&h.ctx, deployment.id).await;

        let stored = h.store.deployment(deployment.id).await.unwrap();
        assert_eq!(stored.status, DeploymentStatus::Failed);
        assert_eq!(stored.exit_code, Some(1));
        assert!(stored.error_output.starts_with("Composer could not install"));
        assert!(stored.release.is_some());

        assert!(!h.transport.transcript().contains("ln -sfn"));
        let site = h.store.site(h.site.id).await.unwrap();
        assert!(site.last_deployed_at.is_none());
    }

    #[tokio::test]
    async fn test_script_snapshot_survives_site_edit() {
        let h = harness().await;
        let deployment = h
            .deployer
            .trigger(h.site.id, CommitInfo::default())
            .await
            .unwrap();
        h.store
            .update_site(
                h.site.id,
                Box::new(|s| {
                    s.deployment_script = "php artisan down".to_string();
                    Ok(())
                }),
            )
            .await
            .unwrap();

        run_deployment(&h.ctx, deployment.id).await;

        let transcript = h.transport.transcript();
        assert!(transcript.contains("php artisan optimize"));
        assert!(!transcript.contains("php artisan down"));
        assert_eq!(
            h.store.deployment(deployment.id).await.unwrap().deployment_script,
            "php artisan optimize"
        );
    }

    #[tokio::test]
    async fn test_job_runs_only_once() {
        let h = harness().await;
        let deployment = h
            .deployer
            .trigger(h.site.id, CommitInfo::default())
            .await
            .unwrap();
        run_deployment(&h.ctx, deployment.id).await;
        let first = h.transport.commands().len();

        run_deployment(&h.ctx, deployment.id).await;
        assert_eq!(h.transport.commands().len(), first);
    }

    #[tokio::test]
    async fn test_concurrent_deployments_use_distinct_releases() {
        let h = harness().await;
        let a = h.deployer.trigger(h.site.id, CommitInfo::default()).await.unwrap();
        let b = h.deployer.trigger(h.site.id, CommitInfo::default()).await.unwrap();

        tokio::join!(run_deployment(&h.ctx, a.id), run_deployment(&h.ctx, b.id));

        let a = h.store.deployment(a.id).await.unwrap();
        let b = h.store.deployment(b.id).await.unwrap();
        assert_eq!(a.status, DeploymentStatus::Success);
        assert_eq!(b.status, DeploymentStatus::Success);
        assert!(a.release.is_some() && b.release.is_some());
        assert_ne!(a.release, b.release);
        assert_eq!(h.transport.transcript().matches("git clone").count(), 2);
        assert_eq!(h.store.site(h.site.id).await.unwrap().active_deployment, None);
    }

    #[tokio::test]
    async fn test_busy_site_hands_waiting_deployment_to_running_one() {
        let h = harness().await;
        let first = h.deployer.trigger(h.site.id, CommitInfo::default()).await.unwrap();
        let second = h.deployer.trigger(h.site.id, CommitInfo::default()).await.unwrap();
        let running = first.id;
        h.store
            .update_site(
                h.site.id,
                Box::new(move |s| {
                    s.active_deployment = Some(running);
                    Ok(())
                }),
            )
            .await
            .unwrap();

        run_deployment(&h.ctx, second.id).await;
        assert_eq!(
            h.store.deployment(second.id).await.unwrap().status,
            DeploymentStatus::Pending
        );
        assert!(h.transport.commands().is_empty());

        h.store
            .update_site(
                h.site.id,
                Box::new(|s| {
                    s.active_deployment = None;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        run_deployment(&h.ctx, first.id).await;

        for id in [first.id, second.id] {
            assert_eq!(
                h.store.deployment(id).await.unwrap().status,
                DeploymentStatus::Success
            );
        }
    }

    #[tokio::test]
    async fn test_webhook_push_triggers_deploy() {
        let mut h = harness().await;
        let body = PUSH.as_bytes();
        let signature = sign(&h.site.webhook_secret, body);

        let outcome = h
            .deployer
            .handle_webhook(h.site.id, Some("push"), Some(&signature), body)
            .await
            .unwrap();

        match outcome {
            WebhookOutcome::Deployed { deployment } => {
                assert_eq!(deployment.commit_sha.as_deref(), Some("9f2c1e0d"));
                assert_eq!(deployment.branch, "main");
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(matches!(h.receiver.try_recv(), Some(Job::Deploy { .. })));
    }

    #[tokio::test]
    async fn test_webhook_ignores_other_branch_and_bad_signature() {
        let mut h = harness().await;
        let body = PUSH.replace("refs/heads/main", "refs/heads/feature");
        let signature = sign(&h.site.webhook_secret, body.as_bytes());

        let outcome = h
            .deployer
            .handle_webhook(h.site.id, Some("push"), Some(&signature), body.as_bytes())
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
        assert_eq!(h.receiver.try_recv(), None);

        let err = h
            .deployer
            .handle_webhook(h.site.id, Some("push"), Some("sha256=00"), PUSH.as_bytes())
            .await
            .unwrap_err();
        assert!(matches!(err, HostwrightError::Authorization(_)));
    }
}
