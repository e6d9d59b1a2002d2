//! Conflict guard: pure checks run before a resource job is enqueued.
//!
//! Every check returns [`ValidationErrors`] keyed by the form field the
//! message belongs to (`type`, `port`, `user`, `version`, `name`, ...).

use crate::error::ValidationErrors;
use crate::model::{Category, Resource, ResourceSpec, Site};
use crate::status::{Operation, TaskStatus};

fn plural(count: usize, singular: &str, plural: &str) -> String {
    if count == 1 {
        format!("1 {}", singular)
    } else {
        format!("{} {}", count, plural)
    }
}

/// "1 site currently depends on ..." / "3 sites currently depend on ...".
fn dependents_message(sites: &[&Site], what: &str) -> String {
    let domains: Vec<&str> = sites.iter().map(|s| s.domain.as_str()).collect();
    let verb = if sites.len() == 1 { "depends" } else { "depend" };
    format!(
        "{} currently {} on {}: {}.",
        plural(sites.len(), "site", "sites"),
        verb,
        what,
        domains.join(", ")
    )
}

/// A resource that still occupies its category, port and identity.
fn occupies(resource: &Resource) -> bool {
    resource.status() != TaskStatus::Failed
}

/// Field-level checks that need no other records.
pub fn check_spec(spec: &ResourceSpec) -> Result<(), ValidationErrors> {
    let mut errors = ValidationErrors::new();

    if spec.listening_port() == Some(0) {
        errors.add("port", "The port must be between 1 and 65535.");
    }

    match spec {
        ResourceSpec::DatabaseEngine { version, .. }
        | ResourceSpec::PhpRuntime { version }
        | ResourceSpec::NodeRuntime { version } => {
            if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit() || c == '.') {
                errors.add("version", format!("\"{}\" is not a valid version.", version));
            }
        }
        ResourceSpec::Database { name, charset } => {
            if !is_identifier(name) {
                errors.add(
                    "name",
                    "Database names may only contain letters, numbers, dashes and underscores.",
                );
            }
            if !is_identifier(charset) {
                errors.add("charset", format!("\"{}\" is not a valid character set.", charset));
            }
        }
        ResourceSpec::DatabaseUser {
            username, password, ..
        } => {
            if !is_identifier(username) {
                errors.add(
                    "user",
                    "User names may only contain letters, numbers, dashes and underscores.",
                );
            }
            if password.len() < 8 {
                errors.add("password", "The password must be at least 8 characters.");
            }
        }
        ResourceSpec::FirewallRule { name, port, .. } => {
            if name.trim().is_empty() {
                errors.add("name", "The rule needs a name.");
            }
            if *port == 0 {
                errors.add("port", "The port must be between 1 and 65535.");
            }
        }
        ResourceSpec::ScheduledTask {
            command,
            user,
            frequency,
        } => {
            check_command(&mut errors, command, user);
            if !is_cron_frequency(frequency) {
                errors.add(
                    "frequency",
                    format!("\"{}\" is not a valid cron expression.", frequency),
                );
            }
        }
        ResourceSpec::SupervisorTask {
            command,
            user,
            processes,
            ..
        } => {
            check_command(&mut errors, command, user);
            if *processes == 0 {
                errors.add("processes", "At least one process is required.");
            }
        }
        ResourceSpec::Cache { .. } | ResourceSpec::ReverseProxy { .. } | ResourceSpec::Firewall => {}
    }

    errors.into_result()
}

fn check_command(errors: &mut ValidationErrors, command: &str, user: &str) {
    if command.trim().is_empty() || command.contains('\n') {
        errors.add("command", "The command must be a single, non-empty line.");
    }
    if !is_identifier(user) {
        errors.add("user", format!("\"{}\" is not a valid system user.", user));
    }
}

fn is_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_cron_frequency(value: &str) -> bool {
    const KEYWORDS: [&str; 8] = [
        "@reboot", "@yearly", "@annually", "@monthly", "@weekly", "@daily", "@midnight", "@hourly",
    ];
    if KEYWORDS.contains(&value) {
        return true;
    }
    let fields: Vec<&str> = value.split_whitespace().collect();
    fields.len() == 5
        && fields.iter().all(|f| {
            f.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-'))
        })
}

/// Checks a new resource against the server's existing resources.
pub fn check_install(candidate: &ResourceSpec, existing: &[Resource]) -> Result<(), ValidationErrors> {
    check_spec(candidate)?;

    let mut errors = ValidationErrors::new();
    let category = candidate.category();
    let live: Vec<&Resource> = existing.iter().filter(|r| occupies(r)).collect();

    if category.is_exclusive() {
        if let Some(other) = live.iter().find(|r| r.category() == category) {
            errors.add(
                "type",
                format!(
                    "A {} is already installed on this server ({}).",
                    category,
                    other.spec.label()
                ),
            );
        }
    }

    if matches!(category, Category::Database | Category::DatabaseUser)
        && !live.iter().any(|r| r.category() == Category::DatabaseEngine)
    {
        errors.add("type", "Install a database engine on this server first.");
    }

    if let ResourceSpec::DatabaseUser { databases, .. } = candidate {
        check_grants(&mut errors, databases, &live);
    }

    check_port(&mut errors, candidate, &live, None);
    check_identity(&mut errors, candidate, &live, None);

    errors.into_result()
}

/// Checks the requested configuration of an update.
pub fn check_update(
    resource: &Resource,
    target: &ResourceSpec,
    existing: &[Resource],
) -> Result<(), ValidationErrors> {
    check_spec(target)?;

    let mut errors = ValidationErrors::new();
    if target.category() != resource.category() {
        errors.add(
            "type",
            format!("A {} cannot be changed into a {}.", resource.category(), target.category()),
        );
        return Err(errors);
    }

    match (&resource.spec, target) {
        (
            ResourceSpec::DatabaseEngine { engine, .. },
            ResourceSpec::DatabaseEngine { engine: wanted, .. },
        ) if engine != wanted => {
            errors.add("type", "The database engine of an existing install cannot be changed.");
        }
        (ResourceSpec::Cache { engine, .. }, ResourceSpec::Cache { engine: wanted, .. })
            if engine != wanted =>
        {
            errors.add("type", "The cache engine of an existing install cannot be changed.");
        }
        (
            ResourceSpec::DatabaseUser { username, host, .. },
            ResourceSpec::DatabaseUser {
                username: wanted_name,
                host: wanted_host,
                ..
            },
        ) if username != wanted_name || host != wanted_host => {
            errors.add("user", "A database user cannot be renamed.");
        }
        _ => {}
    }

    let live: Vec<&Resource> = existing.iter().filter(|r| occupies(r)).collect();
    if let ResourceSpec::DatabaseUser { databases, .. } = target {
        check_grants(&mut errors, databases, &live);
    }
    check_port(&mut errors, target, &live, Some(resource));
    check_identity(&mut errors, target, &live, Some(resource));

    errors.into_result()
}

fn check_grants(errors: &mut ValidationErrors, databases: &[String], live: &[&Resource]) {
    for wanted in databases {
        let exists = live.iter().any(|r| {
            matches!(&r.spec, ResourceSpec::Database { name, .. } if name == wanted)
        });
        if !exists {
            errors.add("databases", format!("The database \"{}\" does not exist.", wanted));
        }
    }
}

fn check_port(
    errors: &mut ValidationErrors,
    candidate: &ResourceSpec,
    live: &[&Resource],
    itself: Option<&Resource>,
) {
    let Some(port) = candidate.listening_port() else {
        return;
    };
    let clash = live
        .iter()
        .filter(|r| itself.map_or(true, |me| me.id != r.id))
        .find(|r| {
            r.spec.listening_port() == Some(port)
                || r.pending_spec.as_ref().and_then(ResourceSpec::listening_port) == Some(port)
        });
    if let Some(other) = clash {
        errors.add(
            "port",
            format!("Port {} is already in use by {}.", port, other.spec.label()),
        );
    }
}

fn check_identity(
    errors: &mut ValidationErrors,
    candidate: &ResourceSpec,
    live: &[&Resource],
    itself: Option<&Resource>,
) {
    let Some((field, value)) = candidate.identity() else {
        return;
    };
    let category = candidate.category();
    let taken = live
        .iter()
        .filter(|r| itself.map_or(true, |me| me.id != r.id))
        .filter(|r| r.category() == category)
        .any(|r| r.spec.identity().map(|(_, v)| v) == Some(value.clone()));
    if taken {
        errors.add(
            field,
            format!("The {} {} already exists on this server.", category, value),
        );
    }
}

/// Distinguished resources reject remove and update in every state.
pub fn check_protected(resource: &Resource, operation: Operation) -> Result<(), ValidationErrors> {
    if !matches!(operation, Operation::Remove | Operation::Update) || !resource.is_protected() {
        return Ok(());
    }

    let (field, message) = match &resource.spec {
        ResourceSpec::DatabaseUser { username, .. } => (
            "user",
            format!("The {} user is managed by the server and cannot be changed.", username),
        ),
        ResourceSpec::PhpRuntime { .. } | ResourceSpec::NodeRuntime { .. } => (
            "version",
            format!(
                "{} is the server's default and cannot be changed. Make another version the default first.",
                resource.spec.label()
            ),
        ),
        ResourceSpec::FirewallRule { port, .. } => (
            "port",
            format!("The rule for port {} is required by the server.", port),
        ),
        ResourceSpec::Database { name, .. } => (
            "name",
            format!("The database \"{}\" is managed by the server.", name),
        ),
        other => (
            "type",
            format!("The default {} cannot be changed.", other.category()),
        ),
    };
    Err(ValidationErrors::single(field, message))
}

/// Blocks remove and disable while other records depend on `resource`.
pub fn check_dependents(
    resource: &Resource,
    operation: Operation,
    resources: &[Resource],
    sites: &[Site],
) -> Result<(), ValidationErrors> {
    if !matches!(operation, Operation::Remove | Operation::Disable) {
        return Ok(());
    }

    match &resource.spec {
        ResourceSpec::Database { .. } => {
            let dependents: Vec<&Site> = sites
                .iter()
                .filter(|s| s.database_id == Some(resource.id))
                .collect();
            if !dependents.is_empty() {
                return Err(ValidationErrors::single(
                    "name",
                    dependents_message(&dependents, "this database"),
                ));
            }
        }
        ResourceSpec::PhpRuntime { version } => {
            let dependents: Vec<&Site> = sites
                .iter()
                .filter(|s| s.php_version.as_deref() == Some(version.as_str()))
                .collect();
            if !dependents.is_empty() {
                return Err(ValidationErrors::single(
                    "version",
                    dependents_message(&dependents, &format!("PHP {}", version)),
                ));
            }
        }
        ResourceSpec::NodeRuntime { version } => {
            let dependents: Vec<&Site> = sites
                .iter()
                .filter(|s| s.node_version.as_deref() == Some(version.as_str()))
                .collect();
            if !dependents.is_empty() {
                return Err(ValidationErrors::single(
                    "version",
                    dependents_message(&dependents, &format!("Node.js {}", version)),
                ));
            }
        }
        ResourceSpec::DatabaseEngine { .. } => {
            let schemas = resources
                .iter()
                .filter(|r| matches!(r.category(), Category::Database | Category::DatabaseUser))
                .filter(|r| !r.protected)
                .count();
            if schemas > 0 {
                return Err(ValidationErrors::single(
                    "type",
                    format!(
                        "Remove the {} on this engine first.",
                        plural(schemas, "database or user", "databases and users")
                    ),
                ));
            }
        }
        _ => {}
    }

    Ok(())
}
