//! Control-plane half of the bootstrap: steps 4 to 8 over SSH.

use super::steps::{ProvisionStep, StepStatus};
use crate::error::{HostwrightError, Result};
use crate::guard;
use crate::installer::{self, BuildContext};
use crate::job::{classify, JobContext};
use crate::model::{
    DatabaseEngine, FirewallAction, ProvisionStatus, Protocol, Resource, ResourceSpec, Server,
    ServerEventKind, ServerId,
};
use crate::status::{Operation, TaskStatus};
use crate::store::{DefaultClaim, InsertCheck};
use crate::transport::RemoteCommand;

/// Resources one step leaves behind, with how each claims defaults.
struct Planned {
    resource: Resource,
    /// Installed by another resource of the same step; no commands.
    implicit: bool,
    claim: Option<DefaultClaim>,
}

impl Planned {
    fn new(server: &Server, spec: ResourceSpec) -> Self {
        Self {
            resource: Resource::provisioned(server.id, spec),
            implicit: false,
            claim: None,
        }
    }

    fn protected(mut self) -> Self {
        self.resource.protected = true;
        self
    }

    fn implicit(mut self) -> Self {
        self.implicit = true;
        self
    }

    fn claiming(mut self, claim: DefaultClaim) -> Self {
        self.claim = Some(claim);
        self
    }
}

fn superuser(engine: DatabaseEngine) -> &'static str {
    match engine {
        DatabaseEngine::Postgresql => "postgres",
        DatabaseEngine::Mysql | DatabaseEngine::Mariadb => "root",
    }
}

fn rule(server: &Server, name: &str, port: u16) -> Planned {
    Planned::new(
        server,
        ResourceSpec::FirewallRule {
            name: name.to_string(),
            protocol: Protocol::Tcp,
            port,
            source: None,
            action: FirewallAction::Allow,
        },
    )
}

fn plan(step: ProvisionStep, server: &Server) -> Vec<Planned> {
    let stack = &server.stack;
    match step {
        ProvisionStep::PHP => vec![Planned::new(
            server,
            ResourceSpec::PhpRuntime {
                version: stack.php_version.clone(),
            },
        )
        .claiming(DefaultClaim::IfVacant)],
        ProvisionStep::WEB_SERVER => vec![Planned::new(server, ResourceSpec::ReverseProxy { port: 80 })],
        ProvisionStep::DATABASE => {
            let engine = stack.database;
            vec![
                Planned::new(
                    server,
                    ResourceSpec::DatabaseEngine {
                        engine,
                        version: stack.database_version.clone(),
                        port: engine.default_port(),
                    },
                ),
                Planned::new(
                    server,
                    ResourceSpec::DatabaseUser {
                        username: superuser(engine).to_string(),
                        password: server.database_password.clone(),
                        host: "localhost".to_string(),
                        databases: Vec::new(),
                    },
                )
                .protected()
                .implicit(),
            ]
        }
        ProvisionStep::CACHE => stack
            .cache
            .map(|engine| {
                Planned::new(
                    server,
                    ResourceSpec::Cache {
                        engine,
                        port: engine.default_port(),
                    },
                )
            })
            .into_iter()
            .collect(),
        ProvisionStep::FINALIZING => vec![
            Planned::new(server, ResourceSpec::Firewall).protected(),
            rule(server, "ssh", 22).protected(),
            rule(server, "http", 80),
            rule(server, "https", 443),
        ],
        _ => Vec::new(),
    }
}

fn commands(step: ProvisionStep, server: &Server, planned: &[Planned]) -> Result<Vec<RemoteCommand>> {
    let mut resources: Vec<Resource> = Vec::new();
    let mut commands = Vec::new();
    for item in planned {
        if !item.implicit {
            let ctx = BuildContext::new(server, &resources);
            commands.extend(installer::build(Operation::Install, &item.resource, &ctx)?);
        }
        resources.push(item.resource.clone());
    }
    if step == ProvisionStep::FINALIZING {
        commands.push(RemoteCommand::new(
            "systemctl enable --now supervisor && systemctl enable --now cron",
        ));
    }
    Ok(commands)
}

/// Runs steps 4 to 8 in order. Each step is claimed against the server's
/// bootstrap status and its own entry in the step map first, so a retry in
/// between or a second run of the same bootstrap is discarded.
pub async fn run_stack_provisioning(ctx: &JobContext, server_id: ServerId) {
    match run(ctx, server_id).await {
        Ok(()) => {}
        Err(HostwrightError::StateConflict(reason)) => {
            tracing::info!(%server_id, %reason, "Stack provisioning discarded");
        }
        Err(e) => {
            tracing::error!(%server_id, error = %e, "Stack provisioning aborted");
            if let Err(e) = mark_failed(ctx, server_id, None, e.to_string()).await {
                tracing::error!(%server_id, error = %e, "Could not record provisioning failure");
            }
        }
    }
}

async fn run(ctx: &JobContext, server_id: ServerId) -> Result<()> {
    for step in ProvisionStep::control_plane() {
        let server = ctx
            .store
            .update_server(
                server_id,
                Box::new(move |server| {
                    if server.provision_status != ProvisionStatus::Installing {
                        return Err(HostwrightError::conflict(format!(
                            "bootstrap is {} before step {}",
                            server.provision_status, step
                        )));
                    }
                    if let Some(claimed @ (StepStatus::Installing | StepStatus::Completed)) =
                        server.provision.get(step)
                    {
                        return Err(HostwrightError::conflict(format!(
                            "step {} is already {} by another run",
                            step, claimed
                        )));
                    }
                    server.provision.set(step, StepStatus::Installing);
                    server.touch();
                    Ok(())
                }),
            )
            .await?;

        tracing::info!(%server_id, %step, name = step.name(), "Provision step started");

        let planned = plan(step, &server);
        let commands = commands(step, &server, &planned)?;
        let execution = ctx.transport.execute(&server, &commands).await;
        if !execution.success() {
            let log = classify::error_log(planned.first().map(|p| &p.resource.spec), &execution);
            tracing::warn!(%server_id, %step, exit_code = execution.exit_code(), "Provision step failed");
            return mark_failed(ctx, server_id, Some(step), log).await;
        }

        for item in planned {
            let spec = item.resource.spec.clone();
            let check: InsertCheck = Box::new(move |existing| {
                guard::check_install(&spec, existing)?;
                Ok(())
            });
            ctx.store
                .insert_resource(item.resource, check, item.claim)
                .await?;
        }

        let last = step == ProvisionStep::FINALIZING;
        ctx.store
            .update_server(
                server_id,
                Box::new(move |server| {
                    server.provision.set(step, StepStatus::Completed);
                    if last {
                        server.supervisor_status = Some(TaskStatus::Active);
                        server.scheduler_status = Some(TaskStatus::Active);
                        server.monitoring_status = Some(TaskStatus::Active);
                        server.provision_status = ProvisionStatus::Completed;
                        server.record_event(ServerEventKind::Provisioning, "Server provisioned.");
                    }
                    server.touch();
                    Ok(())
                }),
            )
            .await?;

        tracing::info!(%server_id, %step, name = step.name(), "Provision step completed");
    }
    Ok(())
}

async fn mark_failed(
    ctx: &JobContext,
    server_id: ServerId,
    step: Option<ProvisionStep>,
    log: String,
) -> Result<()> {
    ctx.store
        .update_server(
            server_id,
            Box::new(move |server| {
                let message = match step {
                    Some(step) => {
                        server.provision.set(step, StepStatus::Failed);
                        format!("Step {} ({}) failed.\n\n{}", step, step.name(), log)
                    }
                    None => format!("Provisioning failed.\n\n{}", log),
                };
                server.provision_status = ProvisionStatus::Failed;
                server.record_event(ServerEventKind::Provisioning, message);
                server.touch();
                Ok(())
            }),
        )
        .await?;
    Ok(())
}
