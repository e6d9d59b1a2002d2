use console::style;

use super::serve::signer;
use crate::config::{parse_duration, AppConfig};
use crate::error::{HostwrightError, Result};

pub fn execute(config: &AppConfig, path: &str, ttl: Option<&str>) -> Result<()> {
    config.validate()?;

    let ttl = match ttl {
        Some(value) => parse_duration(value).ok_or_else(|| {
            HostwrightError::Config(format!(
                "Invalid ttl '{}'. Use format like '2h', '30m', or '3600'",
                value
            ))
        })?,
        None => config.signed_url_ttl(),
    };
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|e| HostwrightError::Config(format!("Invalid ttl: {}", e)))?;

    let url = signer(config)?
        .sign(path.trim_start_matches('/'), &[], ttl)
        .map_err(|e| HostwrightError::Config(format!("Invalid path '{}': {}", path, e)))?;

    println!("{}", url);
    eprintln!(
        "{}",
        style(format!("Expires in {}", crate::utils::format_duration(ttl.num_seconds()))).dim()
    );
    Ok(())
}
