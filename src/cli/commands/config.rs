//! Config command implementation.

use crate::cli::load_config;
use crate::core::config::ConfigOverrides;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::Path;

/// Configuration operations.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

/// Config subcommands.
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Validate the configuration file and overrides.
    Validate,
    /// Print the effective configuration with defaults.
    Show {
        /// Output format (toml, json).
        #[arg(long, default_value = "toml")]
        format: String,
    },
}

/// Run the config command.
pub fn run_config(args: ConfigArgs, path: Option<&Path>, overrides: &ConfigOverrides) -> Result<()> {
    match args.command {
        ConfigCommand::Validate => validate_config(path, overrides),
        ConfigCommand::Show { format } => show_config(path, overrides, &format),
    }
}

fn validate_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<()> {
    let config = load_config(path, overrides)?;
    println!("✓ Configuration is valid");
    println!("  mode: {}", config.cluster.mode);
    println!("  bucket: {}", config.cluster.bucket);
    println!("  hosts: {}", config.cluster.hosts.join(", "));
    if config.cluster.password.is_empty() {
        println!("  ⚠ Warning: cluster.password not set");
    }
    if !config.tls.enabled {
        println!("  ⚠ Warning: [tls] not enabled");
    }
    Ok(())
}

fn show_config(path: Option<&Path>, overrides: &ConfigOverrides, format: &str) -> Result<()> {
    let config = load_config(path, overrides)?;
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&config)?),
        _ => println!("{}", toml::to_string_pretty(&config)?),
    }
    Ok(())
}
