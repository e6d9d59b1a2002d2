//! Server registration and the host-reported half of the bootstrap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use url::Url;

use super::script::{render_bootstrap_script, ScriptInput};
use super::signed_url::UrlSigner;
use super::steps::{ProvisionStep, StepStatus, STEP_COUNT};
use crate::config::AppConfig;
use crate::error::{HostwrightError, Result, ValidationErrors};
use crate::job::{Job, JobQueue};
use crate::model::{ConnectionStatus, ProvisionStatus, Server, ServerEventKind, ServerId};
use crate::store::Store;
use crate::utils::{generate_password, shell_quote};

/// A validated step callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepReport {
    pub step: ProvisionStep,
    pub status: StepStatus,
}

impl StepReport {
    /// Validates raw callback fields. Steps outside `1..=8` are unknown;
    /// steps 4 to 8 belong to the control plane and are refused too.
    pub fn parse(step: Option<&str>, status: Option<&str>) -> std::result::Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::new();

        let step = match step.map(str::trim) {
            None | Some("") => {
                errors.add("step", "The step field is required.");
                None
            }
            Some(raw) => match raw.parse::<u8>().ok().and_then(ProvisionStep::new) {
                None => {
                    errors.add(
                        "step",
                        format!("The step must be between 1 and {}.", STEP_COUNT),
                    );
                    None
                }
                Some(step) if !step.is_host_reported() => {
                    errors.add(
                        "step",
                        format!("Step {} is run by the control plane and cannot be reported.", step),
                    );
                    None
                }
                Some(step) => Some(step),
            },
        };

        let status = match status.map(str::trim) {
            None | Some("") => {
                errors.add("status", "The status field is required.");
                None
            }
            Some(raw) => match StepStatus::try_from(raw) {
                Ok(status) => Some(status),
                Err(_) => {
                    errors.add(
                        "status",
                        "The status must be one of pending, installing, completed, failed.",
                    );
                    None
                }
            },
        };

        match (step, status) {
            (Some(step), Some(status)) => Ok(Self { step, status }),
            _ => Err(errors),
        }
    }
}

/// Output of [`Provisioner::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub server: Server,
    pub script_url: Url,
    /// One-liner the operator runs on the new host.
    pub command: String,
}

#[derive(Clone)]
pub struct Provisioner {
    store: Arc<dyn Store>,
    queue: JobQueue,
    signer: UrlSigner,
    config: Arc<AppConfig>,
    public_key: String,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn Store>,
        queue: JobQueue,
        signer: UrlSigner,
        config: Arc<AppConfig>,
        public_key: impl Into<String>,
    ) -> Self {
        Self {
            store,
            queue,
            signer,
            config,
            public_key: public_key.into(),
        }
    }

    pub fn signer(&self) -> &UrlSigner {
        &self.signer
    }

    pub async fn register(&self, name: &str, ip_address: &str, ssh_port: u16) -> Result<Registration> {
        let server = Server::new(
            name,
            ip_address,
            ssh_port,
            &self.config.ssh_user,
            self.config.stack.clone(),
        );
        self.store.insert_server(server.clone()).await?;

        let script_url = self.script_url(server.id)?;
        let command = format!("curl -fsSL {} | bash", shell_quote(script_url.as_str()));

        tracing::info!(server_id = %server.id, name, ip_address, "Server registered");
        Ok(Registration {
            server,
            script_url,
            command,
        })
    }

    fn sign(&self, path: &str) -> Result<Url> {
        let ttl = chrono::Duration::from_std(self.config.signed_url_ttl())
            .map_err(|e| HostwrightError::Config(format!("Invalid signed URL lifetime: {}", e)))?;
        self.signer
            .sign(path, &[], ttl)
            .map_err(|e| HostwrightError::Config(format!("Invalid app URL: {}", e)))
    }

    /// Checks a signed request for `path`, relative to the app URL.
    fn verify(&self, path: &str, query: &[(String, String)]) -> Result<()> {
        let url = self
            .signer
            .base()
            .join(path)
            .map_err(|e| HostwrightError::Config(format!("Invalid app URL: {}", e)))?;
        self.signer
            .verify(url.path(), query, Utc::now())
            .map_err(|e| HostwrightError::Authorization(e.to_string()))
    }

    fn script_path(server_id: ServerId) -> String {
        format!("servers/{}/provision/script", server_id)
    }

    fn callback_path(server_id: ServerId) -> String {
        format!("servers/{}/provision/step", server_id)
    }

    pub fn script_url(&self, server_id: ServerId) -> Result<Url> {
        self.sign(&Self::script_path(server_id))
    }

    pub fn callback_url(&self, server_id: ServerId) -> Result<Url> {
        self.sign(&Self::callback_path(server_id))
    }

    pub fn verify_script_request(&self, server_id: ServerId, query: &[(String, String)]) -> Result<()> {
        self.verify(&Self::script_path(server_id), query)
    }

    pub fn verify_callback(&self, server_id: ServerId, query: &[(String, String)]) -> Result<()> {
        self.verify(&Self::callback_path(server_id), query)
    }

    pub async fn bootstrap_script(&self, server_id: ServerId) -> Result<String> {
        let server = self.store.server(server_id).await?;
        let callback_url = self.callback_url(server_id)?;
        render_bootstrap_script(&ScriptInput {
            server: &server,
            callback_url: callback_url.as_str(),
            public_key: &self.public_key,
            sites_user: &self.config.sites_user,
        })
    }

    /// Applies one host callback. Writes are last-writer-wins per step.
    pub async fn record_step(&self, server_id: ServerId, report: StepReport) -> Result<Server> {
        let StepReport { step, status } = report;
        tracing::info!(%server_id, %step, %status, name = step.name(), "Provision step reported");
        if status == StepStatus::Failed {
            tracing::error!(%server_id, %step, name = step.name(), "Provision step failed on host");
        }

        let fresh_host = step == ProvisionStep::WAITING_FOR_CONNECTION && status == StepStatus::Completed;
        if fresh_host {
            // Make sure the server exists before wiping its records.
            self.store.server(server_id).await?;
            let cleared = self.store.clear_resources(server_id).await?;
            if cleared > 0 {
                tracing::info!(%server_id, cleared, "Cleared resources of re-imaged host");
            }
        }

        let handover = Arc::new(AtomicBool::new(false));
        let claimed = handover.clone();
        let server = self
            .store
            .update_server(
                server_id,
                Box::new(move |server| {
                    let previous = server.provision.get(step);
                    server.provision.set(step, status);
                    if fresh_host {
                        server.provision.reset_to_first_completed();
                        server.connection_status = ConnectionStatus::Connected;
                        server.provision_status = ProvisionStatus::Installing;
                        server
                            .events
                            .retain(|e| e.kind != ServerEventKind::Provisioning);
                        server.record_event(ServerEventKind::Connection, "Server connected.");
                    }
                    if status == StepStatus::Failed {
                        server.provision_status = ProvisionStatus::Failed;
                        server.record_event(
                            ServerEventKind::Provisioning,
                            format!("Step {} ({}) failed on the host.", step, step.name()),
                        );
                    }
                    // Only the report that moves step 3 to completed hands
                    // over; redelivered copies of it queue nothing.
                    if step == ProvisionStep::AUTHORIZING
                        && status == StepStatus::Completed
                        && previous != Some(StepStatus::Completed)
                        && server.provision_status == ProvisionStatus::Installing
                    {
                        claimed.store(true, Ordering::SeqCst);
                    }
                    server.touch();
                    Ok(())
                }),
            )
            .await?;

        if handover.load(Ordering::SeqCst) {
            self.queue.enqueue(Job::StackProvision { server_id })?;
        }

        Ok(server)
    }

    /// Starts the bootstrap over with fresh credentials. The step map is
    /// kept for display until step 1 completes again.
    pub async fn retry_provisioning(&self, server_id: ServerId) -> Result<Server> {
        let server = self
            .store
            .update_server(
                server_id,
                Box::new(|server| {
                    if server.provision_status != ProvisionStatus::Failed {
                        return Err(HostwrightError::conflict(format!(
                            "Provisioning can only be retried after it failed; it is {}.",
                            server.provision_status
                        )));
                    }
                    server.root_password = generate_password(32);
                    server.connection_status = ConnectionStatus::Pending;
                    server.provision_status = ProvisionStatus::Pending;
                    server.events.retain(|e| {
                        !matches!(
                            e.kind,
                            ServerEventKind::Provisioning | ServerEventKind::Connection
                        )
                    });
                    server.touch();
                    Ok(())
                }),
            )
            .await?;

        tracing::info!(%server_id, "Provisioning retry requested");
        Ok(server)
    }
}
