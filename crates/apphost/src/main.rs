//! `apphost`: run or publish an app model file.

use anyhow::{Context, Result};
use apphost_config::{Config, parser};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::Level;

mod commands;

#[derive(Parser)]
#[command(name = "apphost")]
#[command(about = "Apphost - run a graph of dependent services locally")]
#[command(version)]
struct Cli {
    /// App model file path
    #[arg(short, long, global = true, default_value = "apphost.yaml")]
    config: PathBuf,

    /// Debug logging, overriding the file's log level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the app model file
    Validate {
        /// Strict mode - fail on missing environment variables
        #[arg(short, long)]
        strict: bool,
    },

    /// Show the startup batches
    Plan,

    /// Write the deployment manifest
    Publish {
        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Start every resource and keep them running until interrupted
    Run {
        /// Print resource logs while running
        #[arg(short, long)]
        follow_logs: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load(&cli.config)?;
    init_logging(cli.verbose, config.settings.log_level.as_deref());

    smol::block_on(async {
        match cli.command {
            Commands::Validate { strict } => commands::validate::run(&cli.config, &config, strict),
            Commands::Plan => commands::plan::run(&config),
            Commands::Publish { output } => commands::publish::run(&config, output.as_deref()),
            Commands::Run { follow_logs } => {
                commands::run::run(&cli.config, &config, follow_logs).await
            }
        }
    })
}

fn load(path: &Path) -> Result<Config> {
    parser::parse_file(path)
        .with_context(|| format!("Failed to parse configuration {}", path.display()))
}

fn init_logging(verbose: bool, configured: Option<&str>) {
    let level = if verbose {
        Level::DEBUG
    } else {
        configured
            .and_then(|level| level.parse().ok())
            .unwrap_or(Level::INFO)
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}
