use std::str::FromStr;
use std::sync::Arc;

use console::style;
use url::Url;

use crate::api::{self, AppState};
use crate::config::AppConfig;
use crate::deploy::Deployer;
use crate::error::{HostwrightError, Result};
use crate::job::{JobContext, JobQueue, WorkerPool};
use crate::lifecycle::ResourceService;
use crate::provision::{read_public_key, Provisioner, UrlSigner};
use crate::store::{MemoryStore, Store};
use crate::transport::{SshSettings, SshTransport};

/// A host given on the command line as `name@ip[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostArg {
    pub name: String,
    pub ip_address: String,
    pub ssh_port: u16,
}

impl FromStr for HostArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (name, address) = s
            .split_once('@')
            .ok_or_else(|| format!("'{}' is not name@ip[:port]", s))?;
        if name.is_empty() {
            return Err(format!("'{}' has no host name", s));
        }

        let (ip_address, ssh_port) = match address.rsplit_once(':') {
            Some((ip, port)) if !ip.contains(':') => {
                let port = port
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p > 0)
                    .ok_or_else(|| format!("'{}' is not a valid SSH port", port))?;
                (ip, port)
            }
            _ => (address, 22),
        };
        if ip_address.is_empty() {
            return Err(format!("'{}' has no address", s));
        }

        Ok(Self {
            name: name.to_string(),
            ip_address: ip_address.to_string(),
            ssh_port,
        })
    }
}

pub(crate) fn signer(config: &AppConfig) -> Result<UrlSigner> {
    let base = Url::parse(&config.app_url)
        .map_err(|e| HostwrightError::Config(format!("Invalid app_url '{}': {}", config.app_url, e)))?;
    UrlSigner::new(base, &config.app_key)
        .map_err(|e| HostwrightError::Config(format!("Invalid app_key: {}", e)))
}

pub async fn execute(config: AppConfig, hosts: Vec<HostArg>) -> Result<()> {
    config.validate()?;
    let config = Arc::new(config);

    let public_key = read_public_key(&config.ssh_key_path())?;
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let transport = Arc::new(SshTransport::new(SshSettings::from(config.as_ref())));

    let (queue, receiver) = JobQueue::new();
    let pool = WorkerPool::spawn(
        JobContext::new(store.clone(), transport, config.clone()),
        receiver,
        config.workers,
    );
    tracing::info!(workers = pool.size(), "Job workers started");

    let provisioner = Provisioner::new(
        store.clone(),
        queue.clone(),
        signer(&config)?,
        config.clone(),
        public_key,
    );

    for host in hosts {
        let registration = provisioner
            .register(&host.name, &host.ip_address, host.ssh_port)
            .await?;
        println!(
            "{} Registered {} ({})",
            style("✓").green().bold(),
            style(&host.name).cyan(),
            style(registration.server.id).dim()
        );
        println!("  Run this on the host as root:");
        println!("  {}", style(&registration.command).white());
        println!();
    }

    let state = Arc::new(AppState {
        provisioner,
        deployer: Deployer::new(store.clone(), queue.clone()),
        resources: ResourceService::new(store, queue),
        api_token: config.api_token.clone(),
    });

    println!(
        "{} Listening on port {} ({})",
        style("→").cyan().bold(),
        style(config.listen_port).white(),
        style(&config.app_url).dim()
    );
    api::serve(state, config.listen_port).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_arg() {
        assert_eq!(
            "web-1@203.0.113.10".parse::<HostArg>().unwrap(),
            HostArg {
                name: "web-1".to_string(),
                ip_address: "203.0.113.10".to_string(),
                ssh_port: 22,
            }
        );

        let host: HostArg = "db@203.0.113.11:2222".parse().unwrap();
        assert_eq!(host.ip_address, "203.0.113.11");
        assert_eq!(host.ssh_port, 2222);
    }

    #[test]
    fn test_parse_host_arg_ipv6_keeps_default_port() {
        let host: HostArg = "v6@2001:db8::10".parse().unwrap();
        assert_eq!(host.ip_address, "2001:db8::10");
        assert_eq!(host.ssh_port, 22);
    }

    #[test]
    fn test_parse_host_arg_errors() {
        assert!("203.0.113.10".parse::<HostArg>().is_err());
        assert!("@203.0.113.10".parse::<HostArg>().is_err());
        assert!("web@".parse::<HostArg>().is_err());
        assert!("web@203.0.113.10:0".parse::<HostArg>().is_err());
        assert!("web@203.0.113.10:ssh".parse::<HostArg>().is_err());
    }

    #[test]
    fn test_signer_rejects_bad_app_url() {
        let config = AppConfig {
            app_url: "not a url".to_string(),
            app_key: "k".to_string(),
            ..Default::default()
        };
        assert!(signer(&config).is_err());
    }
}
