//! Cache engines, nginx and the ufw firewall.

use super::{write_file, APT};
use crate::error::{HostwrightError, Result};
use crate::model::{CacheEngine, FirewallAction, ResourceSpec};
use crate::transport::RemoteCommand;
use crate::utils::shell_quote;

fn cache_port(engine: CacheEngine, port: u16) -> RemoteCommand {
    RemoteCommand::new(match engine {
        CacheEngine::Redis => format!(
            "sed -i -E 's/^port [0-9]+/port {}/' /etc/redis/redis.conf",
            port
        ),
        CacheEngine::Memcached => format!(
            "sed -i -E 's/^-p [0-9]+/-p {}/' /etc/memcached.conf",
            port
        ),
    })
}

pub(super) fn install_cache(engine: CacheEngine, port: u16) -> Vec<RemoteCommand> {
    let service = engine.service_name();
    let package = match engine {
        CacheEngine::Redis => "redis-server",
        CacheEngine::Memcached => "memcached libmemcached-tools",
    };
    vec![
        RemoteCommand::new(format!(
            "{apt} update -y && {apt} install -y {package}",
            apt = APT,
            package = package
        )),
        cache_port(engine, port),
        RemoteCommand::new(format!(
            "systemctl enable {s} && systemctl restart {s}",
            s = service
        )),
    ]
}

pub(super) fn update_cache(engine: CacheEngine, port: u16) -> Vec<RemoteCommand> {
    vec![
        cache_port(engine, port),
        RemoteCommand::new(format!("systemctl restart {}", engine.service_name())),
    ]
}

pub(super) fn remove_cache(engine: CacheEngine) -> Vec<RemoteCommand> {
    let service = engine.service_name();
    vec![
        RemoteCommand::best_effort(format!("systemctl stop {}", service)),
        RemoteCommand::new(format!(
            "{apt} purge -y {service} && {apt} autoremove -y",
            apt = APT,
            service = service
        )),
    ]
}

fn default_site(port: u16) -> String {
    format!(
        r#"server {{
    listen {port} default_server;
    listen [::]:{port} default_server;
    server_name _;
    root /var/www/html;
    return 444;
}}"#,
        port = port
    )
}

pub(super) fn install_nginx(port: u16) -> Vec<RemoteCommand> {
    vec![
        RemoteCommand::new(format!("{apt} update -y && {apt} install -y nginx", apt = APT)),
        RemoteCommand::new(write_file(
            "/etc/nginx/sites-available/default",
            &default_site(port),
        )),
        RemoteCommand::new("nginx -t && systemctl enable nginx && systemctl reload-or-restart nginx"),
    ]
}

pub(super) fn remove_nginx() -> Vec<RemoteCommand> {
    vec![
        RemoteCommand::best_effort("systemctl stop nginx"),
        RemoteCommand::new(format!(
            "{apt} purge -y 'nginx*' && {apt} autoremove -y",
            apt = APT
        )),
    ]
}

pub(super) fn install_firewall() -> Vec<RemoteCommand> {
    vec![
        RemoteCommand::new(format!("{} install -y ufw", APT)),
        RemoteCommand::new(
            "ufw default deny incoming && ufw default allow outgoing && \
             ufw allow 22/tcp && ufw --force enable",
        ),
    ]
}

pub(super) fn remove_firewall() -> Vec<RemoteCommand> {
    vec![RemoteCommand::new("ufw --force disable")]
}

/// ufw rule body shared by add and delete.
fn rule(spec: &ResourceSpec) -> Result<(FirewallAction, String, String)> {
    match spec {
        ResourceSpec::FirewallRule {
            name,
            protocol,
            port,
            source,
            action,
        } => Ok((
            *action,
            format!(
                "proto {} from {} to any port {}",
                protocol.as_str(),
                source.as_deref().unwrap_or("any"),
                port
            ),
            name.clone(),
        )),
        other => Err(HostwrightError::conflict(format!(
            "A {} is not a firewall rule.",
            other.category()
        ))),
    }
}

pub(super) fn add_rule(spec: &ResourceSpec) -> Result<Vec<RemoteCommand>> {
    let (action, body, name) = rule(spec)?;
    Ok(vec![RemoteCommand::new(format!(
        "ufw {} {} comment {}",
        action.as_str(),
        body,
        shell_quote(&name)
    ))])
}

pub(super) fn delete_rule(spec: &ResourceSpec) -> Result<Vec<RemoteCommand>> {
    let (action, body, _) = rule(spec)?;
    Ok(vec![RemoteCommand::new(format!(
        "ufw delete {} {}",
        action.as_str(),
        body
    ))])
}

pub(super) fn classify(command: &str, stderr: &str) -> Option<&'static str> {
    if stderr.contains("Address already in use") || stderr.contains("bind() to") {
        Some("The port is already used by another process on the server.")
    } else if command.starts_with("ufw") && stderr.contains("ERROR: Bad port") {
        Some("ufw rejected the port. Use a single port number between 1 and 65535.")
    } else if command.starts_with("ufw") && stderr.contains("Could not find a profile matching") {
        Some("ufw could not find the rule to delete. It may have been removed manually.")
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;

    fn http_rule() -> ResourceSpec {
        ResourceSpec::FirewallRule {
            name: "http".to_string(),
            protocol: Protocol::Tcp,
            port: 80,
            source: None,
            action: FirewallAction::Allow,
        }
    }

    #[test]
    fn test_rule_add_and_delete_match() {
        let add = add_rule(&http_rule()).unwrap();
        let delete = delete_rule(&http_rule()).unwrap();
        assert_eq!(add[0].script, "ufw allow proto tcp from any to any port 80 comment 'http'");
        assert_eq!(delete[0].script, "ufw delete allow proto tcp from any to any port 80");
    }

    #[test]
    fn test_nginx_install_tests_config_before_reload() {
        let commands = install_nginx(8080);
        assert!(commands[1].script.contains("listen 8080 default_server;"));
        assert!(commands[2].script.starts_with("nginx -t &&"));
    }

    #[test]
    fn test_cache_port_change() {
        let commands = update_cache(CacheEngine::Memcached, 11212);
        assert!(commands[0].script.contains("-p 11212"));
        assert_eq!(commands[1].script, "systemctl restart memcached");
    }

    #[test]
    fn test_classify_port_clash() {
        assert!(classify("systemctl restart redis-server", "Address already in use").is_some());
        assert!(classify("ufw allow", "ERROR: Bad port").is_some());
        assert!(classify("true", "boom").is_none());
    }
}
