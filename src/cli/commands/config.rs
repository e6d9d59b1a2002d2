use console::style;

use crate::config::AppConfig;
use crate::error::{HostwrightError, Result};
use crate::model::{CacheEngine, DatabaseEngine};

pub fn show() -> Result<()> {
    let config_path = AppConfig::config_path()?;
    let config = AppConfig::load_or_default()?;

    println!("{}", style("Current Configuration").bold().cyan());
    println!();
    println!("  App URL:         {}", style(&config.app_url).white());
    println!("  Listen port:     {}", style(config.listen_port).white());
    println!(
        "  App key:         {}",
        if config.app_key.is_empty() {
            style("(not set)").red()
        } else {
            style("(set)").green()
        }
    );
    println!(
        "  API token:       {}",
        if config.api_token.is_some() {
            style("(set)").green()
        } else {
            style("(none, management API is open)").yellow()
        }
    );
    println!("  Signed URL TTL:  {}", style(&config.signed_url_ttl).yellow());
    println!("  SSH user:        {}", style(&config.ssh_user).white());
    println!("  SSH key:         {}", style(&config.ssh_key_path).dim());
    println!("  Command timeout: {}", style(&config.command_timeout).yellow());
    println!("  Workers:         {}", style(config.workers).white());
    println!("  Keep releases:   {}", style(config.keep_releases).white());
    println!("  Sites user:      {}", style(&config.sites_user).white());
    println!();
    println!("{}", style("Default stack").bold());
    println!("  PHP:             {}", style(&config.stack.php_version).white());
    println!(
        "  Database:        {} {}",
        style(config.stack.database.service_name()).white(),
        style(&config.stack.database_version).white()
    );
    print!("  Cache:           ");
    match config.stack.cache {
        Some(cache) => println!("{}", style(cache.service_name()).white()),
        None => println!("{}", style("(none)").dim()),
    }
    println!();

    if config_path.exists() {
        println!("Config file: {}", style(config_path.display()).dim());
    } else {
        println!(
            "{} (defaults and environment only)",
            style(format!("No config file at {}", config_path.display())).dim()
        );
    }

    if let Err(e) = config.validate() {
        println!();
        println!("{} {}", style("!").yellow().bold(), e);
    }

    Ok(())
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| HostwrightError::Config(format!("{} must be a number, got '{}'", key, value)))
}

pub fn set(key: String, value: String) -> Result<()> {
    let path = AppConfig::config_path()?;
    let mut config = if path.exists() {
        AppConfig::load_from(&path)?
    } else {
        AppConfig::default()
    };

    match key.as_str() {
        "app_url" | "app-url" => config.app_url = value.clone(),
        "app_key" | "app-key" => config.app_key = value.clone(),
        "api_token" | "api-token" => config.api_token = Some(value.clone()).filter(|v| !v.is_empty()),
        "port" | "listen_port" => config.listen_port = parse_number(&key, &value)?,
        "signed_url_ttl" | "signed-url-ttl" => config.signed_url_ttl = value.clone(),
        "ssh_user" | "ssh-user" => config.ssh_user = value.clone(),
        "ssh_key" | "ssh-key" => config.ssh_key_path = value.clone(),
        "command_timeout" | "command-timeout" => config.command_timeout = value.clone(),
        "workers" => config.workers = parse_number(&key, &value)?,
        "keep_releases" | "keep-releases" => config.keep_releases = parse_number(&key, &value)?,
        "sites_user" | "sites-user" => config.sites_user = value.clone(),
        "php_version" | "php-version" => config.stack.php_version = value.clone(),
        "database" => {
            config.stack.database = serde_yaml::from_str::<DatabaseEngine>(&value)
                .map_err(|_| HostwrightError::Config(format!("Unknown database '{}'", value)))?
        }
        "database_version" | "database-version" => config.stack.database_version = value.clone(),
        "cache" => {
            config.stack.cache = match value.as_str() {
                "" | "none" => None,
                other => Some(serde_yaml::from_str::<CacheEngine>(other).map_err(|_| {
                    HostwrightError::Config(format!("Unknown cache '{}'", other))
                })?),
            }
        }
        _ => {
            println!(
                "{} Unknown config key: {}",
                style("!").yellow().bold(),
                style(&key).red()
            );
            println!("\nAvailable keys:");
            println!("  app_url, app_key, api_token, port, signed_url_ttl, ssh_user, ssh_key,");
            println!("  command_timeout, workers, keep_releases, sites_user,");
            println!("  php_version, database, database_version, cache");
            return Ok(());
        }
    }

    config.save()?;

    let shown = if matches!(key.as_str(), "app_key" | "app-key" | "api_token" | "api-token") {
        "********".to_string()
    } else {
        value
    };
    println!(
        "{} Set {} = {}",
        style("✓").green().bold(),
        style(&key).cyan(),
        style(shown).white()
    );

    Ok(())
}
