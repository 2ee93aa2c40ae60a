//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use vox_domain::config::Config;
use vox_domain::error::{Error, Result};

#[derive(Parser)]
#[command(name = "voxline", about = "Real-time telephony voice agent")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "voxline.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway (default).
    Serve,
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the configuration file and exit non-zero on errors.
    Validate,
    /// Print the effective configuration as TOML.
    Show,
}

/// Load the config file; a missing file yields defaults with a warning.
pub fn load_config(path: &std::path::Path) -> Result<Config> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
    toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

pub mod config_cmd {
    use vox_domain::config::{Config, ConfigSeverity};

    /// Print validation issues; returns false when any error exists.
    pub fn validate(config: &Config, path: &std::path::Path) -> bool {
        let issues = config.validate();
        if issues.is_empty() {
            println!("{} is valid", path.display());
            return true;
        }
        for issue in &issues {
            println!("{issue}");
        }
        !issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error)
    }

    pub fn show(config: &Config) {
        match toml::to_string_pretty(config) {
            Ok(s) => println!("{s}"),
            Err(e) => eprintln!("failed to render config: {e}"),
        }
    }
}
