//! `geotorget config`: show or create the config file.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;

use geotorget_core::{config, EngineConfig};

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration, including environment overrides.
    Show,
    /// Write a config file with default values.
    Init,
}

pub fn run(command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let path = config::config_path()?;
            let cfg = config::load().with_context(|| format!("failed to load {}", path.display()))?;
            let source = if path.exists() { "file" } else { "defaults" };
            println!("# {} ({source})", path.display());
            print!("{}", config::render(&cfg)?);
        }
        ConfigCommand::Init => {
            let path = config::init(&EngineConfig::default()).context("config init failed")?;
            println!("{} wrote {}", "✓".green(), path.display());
        }
    }
    Ok(())
}
