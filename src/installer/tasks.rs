//! Scheduled tasks (cron.d) and supervisor programs.

use super::write_file;
use crate::error::{HostwrightError, Result};
use crate::model::{Resource, ResourceSpec};
use crate::transport::RemoteCommand;

fn cron_file(resource: &Resource) -> String {
    format!("/etc/cron.d/hostwright-{}", resource.id.as_uuid().simple())
}

fn program_name(resource: &Resource) -> String {
    format!("hostwright-{}", resource.id.as_uuid().simple())
}

fn supervisor_file(resource: &Resource) -> String {
    format!("/etc/supervisor/conf.d/{}.conf", program_name(resource))
}

fn cron_entry(frequency: &str, user: &str, command: &str) -> String {
    format!(
        "SHELL=/bin/bash\nPATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin\n{} {} {} > /dev/null 2>&1\n",
        frequency, user, command
    )
}

fn supervisor_program(
    name: &str,
    command: &str,
    user: &str,
    processes: u16,
    working_directory: Option<&str>,
) -> String {
    let directory = working_directory
        .map(|dir| format!("directory={}\n", dir))
        .unwrap_or_default();
    format!(
        "[program:{name}]\n\
         command={command}\n\
         {directory}\
         user={user}\n\
         numprocs={processes}\n\
         process_name=%(program_name)s_%(process_num)02d\n\
         autostart=true\n\
         autorestart=true\n\
         stopasgroup=true\n\
         killasgroup=true\n\
         redirect_stderr=true\n\
         stdout_logfile=/var/log/supervisor/{name}.log\n",
        name = name,
        command = command,
        directory = directory,
        user = user,
        processes = processes
    )
}

fn write_definition(resource: &Resource, spec: &ResourceSpec) -> Result<Vec<RemoteCommand>> {
    match spec {
        ResourceSpec::ScheduledTask {
            command,
            user,
            frequency,
        } => {
            let path = cron_file(resource);
            Ok(vec![RemoteCommand::new(format!(
                "{} && chmod 644 {}",
                write_file(&path, &cron_entry(frequency, user, command)),
                path
            ))])
        }
        ResourceSpec::SupervisorTask {
            command,
            user,
            processes,
            working_directory,
        } => {
            let name = program_name(resource);
            Ok(vec![
                RemoteCommand::new(write_file(
                    &supervisor_file(resource),
                    &supervisor_program(
                        &name,
                        command,
                        user,
                        *processes,
                        working_directory.as_deref(),
                    ),
                )),
                RemoteCommand::new("supervisorctl reread && supervisorctl update"),
            ])
        }
        other => Err(not_a_task(other)),
    }
}

fn not_a_task(spec: &ResourceSpec) -> HostwrightError {
    HostwrightError::conflict(format!(
        "A {} cannot be enabled or disabled.",
        spec.category()
    ))
}

pub(super) fn install(resource: &Resource) -> Result<Vec<RemoteCommand>> {
    write_definition(resource, &resource.spec)
}

pub(super) fn rewrite(resource: &Resource, target: &ResourceSpec) -> Result<Vec<RemoteCommand>> {
    let mut commands = write_definition(resource, target)?;
    if matches!(target, ResourceSpec::SupervisorTask { .. }) {
        commands.push(RemoteCommand::new(format!(
            "supervisorctl restart '{}:*'",
            program_name(resource)
        )));
    }
    Ok(commands)
}

pub(super) fn remove(resource: &Resource) -> Vec<RemoteCommand> {
    match &resource.spec {
        ResourceSpec::SupervisorTask { .. } => vec![
            RemoteCommand::best_effort(format!(
                "supervisorctl stop '{}:*'",
                program_name(resource)
            )),
            RemoteCommand::new(format!(
                "rm -f {} && supervisorctl reread && supervisorctl update",
                supervisor_file(resource)
            )),
        ],
        _ => vec![RemoteCommand::new(format!("rm -f {}", cron_file(resource)))],
    }
}

pub(super) fn disable(resource: &Resource) -> Result<Vec<RemoteCommand>> {
    match &resource.spec {
        ResourceSpec::ScheduledTask { .. } => Ok(vec![RemoteCommand::new(format!(
            "rm -f {}",
            cron_file(resource)
        ))]),
        ResourceSpec::SupervisorTask { .. } => Ok(vec![RemoteCommand::new(format!(
            "supervisorctl stop '{}:*'",
            program_name(resource)
        ))]),
        other => Err(not_a_task(other)),
    }
}

pub(super) fn enable(resource: &Resource) -> Result<Vec<RemoteCommand>> {
    match &resource.spec {
        ResourceSpec::ScheduledTask { .. } => write_definition(resource, &resource.spec),
        ResourceSpec::SupervisorTask { .. } => Ok(vec![RemoteCommand::new(format!(
            "supervisorctl start '{}:*'",
            program_name(resource)
        ))]),
        other => Err(not_a_task(other)),
    }
}

pub(super) fn classify(stderr: &str) -> Option<&'static str> {
    if stderr.contains("ERROR (no such process)") || stderr.contains("ERROR (no such group)") {
        Some("Supervisor does not know this program. Re-create the task to restore its configuration.")
    } else if stderr.contains("unix:///var/run/supervisor.sock no such file") {
        Some("Supervisor is not running on the server. Start it with systemctl start supervisor.")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ServerId;

    fn worker() -> Resource {
        Resource::provisioned(
            ServerId::new(),
            ResourceSpec::SupervisorTask {
                command: "php artisan queue:work".to_string(),
                user: "hostwright".to_string(),
                processes: 2,
                working_directory: Some("/home/hostwright/shop/current".to_string()),
            },
        )
    }

    fn schedule() -> Resource {
        Resource::provisioned(
            ServerId::new(),
            ResourceSpec::ScheduledTask {
                command: "php artisan schedule:run".to_string(),
                user: "hostwright".to_string(),
                frequency: "* * * * *".to_string(),
            },
        )
    }

    #[test]
    fn test_supervisor_install_writes_program() {
        let task = worker();
        let commands = install(&task).unwrap();
        let name = program_name(&task);
        assert!(commands[0].script.contains(&format!("[program:{}]", name)));
        assert!(commands[0].script.contains("numprocs=2"));
        assert!(commands[0].script.contains("directory=/home/hostwright/shop/current"));
        assert_eq!(commands[1].script, "supervisorctl reread && supervisorctl update");
    }

    #[test]
    fn test_cron_entry_line() {
        let task = schedule();
        let commands = install(&task).unwrap();
        assert!(commands[0]
            .script
            .contains("* * * * * hostwright php artisan schedule:run > /dev/null 2>&1"));
    }

    #[test]
    fn test_disable_and_enable_supervisor() {
        let task = worker();
        let name = program_name(&task);
        assert_eq!(
            disable(&task).unwrap()[0].script,
            format!("supervisorctl stop '{}:*'", name)
        );
        assert_eq!(
            enable(&task).unwrap()[0].script,
            format!("supervisorctl start '{}:*'", name)
        );
    }

    #[test]
    fn test_disable_cron_removes_file() {
        let task = schedule();
        assert!(disable(&task).unwrap()[0].script.starts_with("rm -f /etc/cron.d/hostwright-"));
    }
}
