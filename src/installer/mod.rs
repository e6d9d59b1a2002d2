//! Command builders for every resource kind.
//!
//! Each kind supplies plain functions that turn a resource into the shell
//! commands for one operation, plus a classifier for its known failure
//! modes. The job runner stays generic and dispatches through [`build`].

mod database;
mod runtime;
mod services;
mod tasks;

pub use runtime::{node_bin_dir, php_binary};

use crate::error::{HostwrightError, Result};
use crate::model::{DatabaseEngine, Resource, ResourceSpec, Server};
use crate::status::Operation;
use crate::transport::RemoteCommand;

/// Prefix for apt invocations.
pub(crate) const APT: &str = "DEBIAN_FRONTEND=noninteractive apt-get -o DPkg::Lock::Timeout=120";

/// Server facts command builders need besides the resource itself.
#[derive(Debug, Clone, Copy)]
pub struct BuildContext<'a> {
    pub server: &'a Server,
    /// Engine of the server's database engine resource, if any.
    pub database_engine: Option<DatabaseEngine>,
}

impl<'a> BuildContext<'a> {
    pub fn new(server: &'a Server, resources: &[Resource]) -> Self {
        let database_engine = resources.iter().find_map(|r| match &r.spec {
            ResourceSpec::DatabaseEngine { engine, .. } => Some(*engine),
            _ => None,
        });
        Self {
            server,
            database_engine,
        }
    }

    pub(crate) fn require_engine(&self) -> Result<DatabaseEngine> {
        self.database_engine.ok_or_else(|| {
            HostwrightError::conflict("No database engine is installed on this server.")
        })
    }
}

/// Commands for `operation` on `resource`.
///
/// Updates build towards `resource.pending_spec` when one is set.
pub fn build(operation: Operation, resource: &Resource, ctx: &BuildContext<'_>) -> Result<Vec<RemoteCommand>> {
    let spec = &resource.spec;
    match operation {
        Operation::Install => install(resource, ctx),
        Operation::Update => {
            let target = resource.pending_spec.as_ref().unwrap_or(spec);
            update(resource, target, ctx)
        }
        Operation::Remove => remove(resource, ctx),
        Operation::Disable => tasks::disable(resource),
        Operation::Enable => tasks::enable(resource),
        Operation::MakeCliDefault => runtime::make_cli_default(spec),
        Operation::Retry | Operation::CancelUpdate => Err(HostwrightError::conflict(format!(
            "{} does not run remote commands",
            operation
        ))),
    }
}

fn install(resource: &Resource, ctx: &BuildContext<'_>) -> Result<Vec<RemoteCommand>> {
    let password = &ctx.server.database_password;
    match &resource.spec {
        ResourceSpec::DatabaseEngine {
            engine,
            version,
            port,
        } => Ok(database::install_engine(*engine, version, *port, password)),
        ResourceSpec::Database { name, charset } => {
            Ok(database::create_schema(ctx.require_engine()?, name, charset, password))
        }
        ResourceSpec::DatabaseUser {
            username,
            password: user_password,
            host,
            databases,
        } => Ok(database::create_user(
            ctx.require_engine()?,
            username,
            user_password,
            host,
            databases,
            password,
        )),
        ResourceSpec::Cache { engine, port } => Ok(services::install_cache(*engine, *port)),
        ResourceSpec::ReverseProxy { port } => Ok(services::install_nginx(*port)),
        ResourceSpec::Firewall => Ok(services::install_firewall()),
        ResourceSpec::FirewallRule { .. } => services::add_rule(&resource.spec),
        ResourceSpec::PhpRuntime { version } => Ok(runtime::install_php(version)),
        ResourceSpec::NodeRuntime { version } => Ok(runtime::install_node(version)),
        ResourceSpec::ScheduledTask { .. } | ResourceSpec::SupervisorTask { .. } => {
            tasks::install(resource)
        }
    }
}

fn update(resource: &Resource, target: &ResourceSpec, ctx: &BuildContext<'_>) -> Result<Vec<RemoteCommand>> {
    if !resource.spec.supports_update() {
        return Err(HostwrightError::conflict(format!(
            "A {} cannot be updated.",
            resource.category()
        )));
    }
    let password = &ctx.server.database_password;
    match (&resource.spec, target) {
        (
            ResourceSpec::DatabaseEngine { engine, .. },
            ResourceSpec::DatabaseEngine { version, port, .. },
        ) => Ok(database::update_engine(*engine, version, *port)),
        (
            ResourceSpec::DatabaseUser { .. },
            ResourceSpec::DatabaseUser {
                username,
                password: user_password,
                host,
                databases,
            },
        ) => Ok(database::update_user(
            ctx.require_engine()?,
            username,
            user_password,
            host,
            databases,
            password,
        )),
        (ResourceSpec::Cache { engine, .. }, ResourceSpec::Cache { port, .. }) => {
            Ok(services::update_cache(*engine, *port))
        }
        (ResourceSpec::PhpRuntime { version }, ResourceSpec::PhpRuntime { .. }) => {
            Ok(runtime::upgrade_php(version))
        }
        (ResourceSpec::NodeRuntime { version }, ResourceSpec::NodeRuntime { .. }) => {
            Ok(runtime::install_node(version))
        }
        (ResourceSpec::ScheduledTask { .. }, ResourceSpec::ScheduledTask { .. })
        | (ResourceSpec::SupervisorTask { .. }, ResourceSpec::SupervisorTask { .. }) => {
            tasks::rewrite(resource, target)
        }
        _ => Err(HostwrightError::conflict(format!(
            "A {} cannot be changed into a {}.",
            resource.category(),
            target.category()
        ))),
    }
}

fn remove(resource: &Resource, ctx: &BuildContext<'_>) -> Result<Vec<RemoteCommand>> {
    let password = &ctx.server.database_password;
    match &resource.spec {
        ResourceSpec::DatabaseEngine { engine, .. } => Ok(database::remove_engine(*engine)),
        ResourceSpec::Database { name, .. } => {
            Ok(database::drop_schema(ctx.require_engine()?, name, password))
        }
        ResourceSpec::DatabaseUser { username, host, .. } => Ok(database::drop_user(
            ctx.require_engine()?,
            username,
            host,
            password,
        )),
        ResourceSpec::Cache { engine, .. } => Ok(services::remove_cache(*engine)),
        ResourceSpec::ReverseProxy { .. } => Ok(services::remove_nginx()),
        ResourceSpec::Firewall => Ok(services::remove_firewall()),
        ResourceSpec::FirewallRule { .. } => services::delete_rule(&resource.spec),
        ResourceSpec::PhpRuntime { version } => Ok(runtime::remove_php(version)),
        ResourceSpec::NodeRuntime { version } => Ok(runtime::remove_node(version)),
        ResourceSpec::ScheduledTask { .. } | ResourceSpec::SupervisorTask { .. } => {
            Ok(tasks::remove(resource))
        }
    }
}

/// Hint for failures specific to one resource kind.
pub fn classify_error(spec: &ResourceSpec, command: &str, stderr: &str) -> Option<&'static str> {
    match spec {
        ResourceSpec::DatabaseEngine { .. }
        | ResourceSpec::Database { .. }
        | ResourceSpec::DatabaseUser { .. } => database::classify(stderr),
        ResourceSpec::Cache { .. }
        | ResourceSpec::ReverseProxy { .. }
        | ResourceSpec::Firewall
        | ResourceSpec::FirewallRule { .. } => services::classify(command, stderr),
        ResourceSpec::PhpRuntime { .. } | ResourceSpec::NodeRuntime { .. } => {
            runtime::classify(stderr)
        }
        ResourceSpec::ScheduledTask { .. } | ResourceSpec::SupervisorTask { .. } => {
            tasks::classify(stderr)
        }
    }
}

/// Heredoc that writes `contents` to `path` verbatim.
pub(crate) fn write_file(path: &str, contents: &str) -> String {
    format!(
        "cat > {} <<'HOSTWRIGHT_EOF'\n{}\nHOSTWRIGHT_EOF",
        path,
        contents.trim_end()
    )
}
