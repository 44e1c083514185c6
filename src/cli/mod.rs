//! Command-line interface.
//!
//! A thin front end for exercising the client against a live cluster.

pub mod commands;

use crate::client::Client;
use crate::core::config::{ClientConfig, ConfigMode, ConfigOverrides};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

/// bucketlink - partition-aware key-value client.
#[derive(Parser, Debug)]
#[command(name = "bucketlink")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Bootstrap hosts, semicolon separated (`a:8091;b:8091`).
    #[arg(long, global = true)]
    pub hosts: Option<String>,

    /// Bucket name.
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// Bucket password.
    #[arg(long, global = true)]
    pub password: Option<String>,

    /// Topology discovery mode (http, in_band).
    #[arg(long, global = true)]
    pub mode: Option<ConfigMode>,

    /// Enable TLS with this CA bundle.
    #[arg(long, global = true)]
    pub ca_path: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Read a key.
    Get(commands::GetArgs),
    /// Store a key.
    Set(commands::SetArgs),
    /// Remove a key.
    Remove(commands::RemoveArgs),
    /// Increment a counter.
    Incr(commands::CounterArgs),
    /// Decrement a counter.
    Decr(commands::CounterArgs),
    /// Show which partition and server own each key.
    Topology(commands::TopologyArgs),
    /// Configuration operations.
    Config(commands::ConfigArgs),
}

impl Cli {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            hosts: self.hosts.clone(),
            bucket: self.bucket.clone(),
            password: self.password.clone(),
            mode: self.mode,
            log_level: self.log_level.clone(),
            tls_ca_path: self.ca_path.clone(),
        }
    }
}

/// Load the file (or defaults), apply overrides and validate.
pub fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<ClientConfig> {
    let mut config = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        }
        None => ClientConfig::default(),
    };
    config.apply_overrides(overrides);
    config.validate()?;
    Ok(config)
}

/// Initialize tracing subscriber if the telemetry feature is enabled.
#[cfg(feature = "telemetry")]
pub fn init_tracing(level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[cfg(not(feature = "telemetry"))]
pub fn init_tracing(_level: &str) {}

/// Run one parsed command line.
pub async fn run(cli: Cli) -> Result<()> {
    let overrides = cli.overrides();
    let path = cli.config.as_deref();

    let command = match cli.command {
        Commands::Config(args) => return commands::run_config(args, path, &overrides),
        command => command,
    };

    let config = load_config(path, &overrides)?;
    init_tracing(&config.telemetry.log_level);
    let client = Client::connect(&config)?;

    let result = match command {
        Commands::Get(args) => commands::run_get(&client, args).await,
        Commands::Set(args) => commands::run_set(&client, args).await,
        Commands::Remove(args) => commands::run_remove(&client, args).await,
        Commands::Incr(args) => commands::run_counter(&client, args, false).await,
        Commands::Decr(args) => commands::run_counter(&client, args, true).await,
        Commands::Topology(args) => {
            commands::run_topology(&client, args, config.timeouts.operation_timeout()).await
        }
        Commands::Config(_) => Ok(()),
    };
    client.shutdown();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_overrides() {
        let cli = Cli::try_parse_from([
            "bucketlink",
            "get",
            "doc",
            "--hosts",
            "a:8091;b:8091",
            "--bucket",
            "beer",
            "--mode",
            "in_band",
        ])
        .unwrap();
        let overrides = cli.overrides();
        assert_eq!(overrides.hosts.as_deref(), Some("a:8091;b:8091"));
        assert_eq!(overrides.bucket.as_deref(), Some("beer"));
        assert_eq!(overrides.mode, Some(ConfigMode::InBand));
        assert!(matches!(cli.command, Commands::Get(_)));
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let overrides = ConfigOverrides {
            hosts: Some("10.0.0.1:11210".to_string()),
            mode: Some(ConfigMode::InBand),
            ..Default::default()
        };
        let config = load_config(None, &overrides).unwrap();
        assert_eq!(config.cluster.hosts, vec!["10.0.0.1:11210"]);
        assert_eq!(config.cluster.mode, ConfigMode::InBand);
    }

    #[test]
    fn test_load_config_rejects_bad_log_level() {
        let overrides = ConfigOverrides {
            log_level: Some("loud".to_string()),
            ..Default::default()
        };
        assert!(load_config(None, &overrides).is_err());
    }
}
