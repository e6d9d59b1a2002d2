pub mod commands;

use clap::{Parser, Subcommand};

use crate::config::AppConfig;
use crate::error::Result;

use commands::serve::HostArg;

#[derive(Parser)]
#[command(name = "hostwright")]
#[command(version)]
#[command(about = "Provision servers over SSH and deploy sites to them")]
#[command(long_about = "Bootstrap fresh hosts through a signed callback handshake, manage their software as resources, and deploy git sites with zero-downtime release swaps.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API and the job workers
    Serve {
        /// Register a host at startup and print its bootstrap command
        /// (name@ip[:port], repeatable)
        #[arg(long = "register", value_name = "NAME@IP[:PORT]")]
        register: Vec<HostArg>,

        /// Listen port (overrides the config file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print a signed capability URL for a path
    SignUrl {
        /// Path relative to the app URL (e.g. servers/<id>/provision/script)
        path: String,

        /// Lifetime of the link (e.g. 30m, 2h)
        #[arg(long)]
        ttl: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Set a configuration value
    Set {
        /// Configuration key
        key: String,
        /// Configuration value
        value: String,
    },
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve { register, port } => {
                let mut config = AppConfig::load_or_default()?;
                if let Some(port) = port {
                    config.listen_port = port;
                }
                commands::serve::execute(config, register).await
            }
            Commands::SignUrl { path, ttl } => {
                let config = AppConfig::load_or_default()?;
                commands::sign_url::execute(&config, &path, ttl.as_deref())
            }
            Commands::Config { command } => match command {
                ConfigCommands::Show => commands::config::show(),
                ConfigCommands::Set { key, value } => commands::config::set(key, value),
            },
        }
    }
}
