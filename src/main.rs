use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use woodpeckers::{Config, Controller};

/// Randomized drinking-bird controller.
#[derive(Parser)]
#[command(name = "woodpeckers", version, disable_version_flag = true)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Print version information
    #[arg(short = 'v', long = "version", action = clap::ArgAction::Version)]
    version: Option<bool>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let config = Config::from_file(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    let mut controller = Controller::from_config(&config)?;
    controller.set_up()?;
    controller.run()?;
    controller.tear_down();

    Ok(())
}
