use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HostwrightError, Result};
use crate::model::ServerStack;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Public base URL hosts use to reach the callback endpoints.
    pub app_url: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Secret for signed capability URLs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_key: String,
    /// Token for the management endpoints; unset disables their auth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_token: Option<String>,
    #[serde(default = "default_signed_url_ttl")]
    pub signed_url_ttl: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    pub ssh_key_path: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout: String,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_keep_releases")]
    pub keep_releases: usize,
    /// Unix user owning site directories on managed hosts.
    #[serde(default = "default_sites_user")]
    pub sites_user: String,
    #[serde(default)]
    pub stack: ServerStack,
}

fn default_listen_port() -> u16 {
    8080
}

fn default_signed_url_ttl() -> String {
    "2h".to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_command_timeout() -> String {
    "10m".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_keep_releases() -> usize {
    5
}

fn default_sites_user() -> String {
    "hostwright".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_url: "http://localhost:8080".to_string(),
            listen_port: default_listen_port(),
            app_key: String::new(),
            api_token: None,
            signed_url_ttl: default_signed_url_ttl(),
            ssh_user: default_ssh_user(),
            ssh_key_path: shellexpand::tilde("~/.ssh/id_ed25519").to_string(),
            command_timeout: default_command_timeout(),
            workers: default_workers(),
            keep_releases: default_keep_releases(),
            sites_user: default_sites_user(),
            stack: ServerStack::default(),
        }
    }
}

impl AppConfig {
    pub fn config_dir() -> Result<PathBuf> {
        if let Some(dir) = dirs::config_dir() {
            return Ok(dir.join("hostwright"));
        }
        let home = std::env::var("HOME")
            .map_err(|_| HostwrightError::Config("HOME environment variable not set".to_string()))?;
        Ok(PathBuf::from(home).join(".config").join("hostwright"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.yaml"))
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;

        if !path.exists() {
            return Err(HostwrightError::Config(format!(
                "Config file not found: {}. Create it or set HOSTWRIGHT_APP_KEY and HOSTWRIGHT_APP_URL.",
                path.display()
            )));
        }

        let mut config = Self::load_from(&path)?;
        config.apply_env();
        Ok(config)
    }

    /// Reads the file at `path` without environment overrides.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content)
            .map_err(|e| HostwrightError::Config(format!("Invalid config: {}", e)))
    }

    /// Loads the config file when present, otherwise defaults; environment
    /// variables win either way.
    pub fn load_or_default() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("HOSTWRIGHT_APP_KEY") {
            self.app_key = key;
        }
        if let Ok(token) = std::env::var("HOSTWRIGHT_API_TOKEN") {
            self.api_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Ok(url) = std::env::var("HOSTWRIGHT_APP_URL") {
            self.app_url = url;
        }
        if let Some(port) = std::env::var("HOSTWRIGHT_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
        {
            self.listen_port = port;
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)
            .map_err(|e| HostwrightError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(&path, content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&path, perms)?;
        }

        Ok(())
    }

    pub fn signed_url_ttl(&self) -> Duration {
        parse_duration(&self.signed_url_ttl).unwrap_or(Duration::from_secs(7200))
    }

    pub fn command_timeout(&self) -> Duration {
        parse_duration(&self.command_timeout).unwrap_or(Duration::from_secs(600))
    }

    pub fn ssh_key_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.ssh_key_path).as_ref())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.app_key.is_empty() {
            return Err(HostwrightError::Config(
                "app_key is empty. Set it in the config file or via HOSTWRIGHT_APP_KEY".to_string(),
            ));
        }

        if url::Url::parse(&self.app_url).is_err() {
            return Err(HostwrightError::Config(format!(
                "Invalid app_url '{}'",
                self.app_url
            )));
        }

        for (field, value) in [
            ("signed_url_ttl", &self.signed_url_ttl),
            ("command_timeout", &self.command_timeout),
        ] {
            if parse_duration(value).is_none() {
                return Err(HostwrightError::Config(format!(
                    "Invalid {} '{}'. Use format like '2h', '30m', or '3600'",
                    field, value
                )));
            }
        }

        if self.workers == 0 {
            return Err(HostwrightError::Config(
                "workers must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim().to_lowercase();

    if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else if let Some(minutes) = s.strip_suffix('m') {
        minutes.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(seconds) = s.strip_suffix('s') {
        seconds.parse::<u64>().ok().map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CacheEngine, DatabaseEngine};
    use std::io::Write;

    fn valid_config() -> AppConfig {
        AppConfig {
            app_key: "base64:test-key".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_duration("60s"), Some(Duration::from_secs(60)));
        assert_eq!(parse_duration("7200"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("  2h  "), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert_eq!(parse_duration("invalid"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("2x"), None);
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.listen_port, 8080);
        assert_eq!(config.ssh_user, "root");
        assert_eq!(config.workers, 4);
        assert_eq!(config.signed_url_ttl().as_secs(), 7200);
        assert_eq!(config.command_timeout().as_secs(), 600);
        assert_eq!(config.stack.database, DatabaseEngine::Mysql);
    }

    #[test]
    fn test_config_serialization_hides_empty_key() {
        let yaml = serde_yaml::to_string(&AppConfig::default()).unwrap();
        assert!(yaml.contains("app_url: http://localhost:8080"));
        assert!(!yaml.contains("app_key"));
    }

    #[test]
    fn test_load_from_file_with_stack() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.yaml");
        let yaml = r#"
app_url: https://panel.example.com
app_key: secret
ssh_key_path: /tmp/test-key
workers: 2
stack:
  php_version: "8.2"
  database: postgresql
  database_version: "16"
  cache: memcached
"#;
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.app_url, "https://panel.example.com");
        assert_eq!(config.workers, 2);
        assert_eq!(config.keep_releases, 5);
        assert_eq!(config.stack.php_version, "8.2");
        assert_eq!(config.stack.database, DatabaseEngine::Postgresql);
        assert_eq!(config.stack.cache, Some(CacheEngine::Memcached));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("config.yaml");
        std::fs::write(&path, "app_url: [unclosed").unwrap();

        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Invalid config"));
    }

    #[test]
    fn test_validate_requires_app_key() {
        let err = AppConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("app_key"));
    }

    #[test]
    fn test_validate_invalid_durations() {
        let config = AppConfig {
            command_timeout: "forever".to_string(),
            ..valid_config()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid command_timeout"));
    }

    #[test]
    fn test_validate_zero_workers() {
        let config = AppConfig {
            workers: 0,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }
}
