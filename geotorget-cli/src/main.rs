//! Geotorget: order download and synchronization CLI.
//!
//! # Usage
//!
//! ```text
//! geotorget sync <ORDER_ID> [--output <dir>] [--parallel <n>] [--dry-run]
//! geotorget sync --all [--dry-run]
//! geotorget check [ORDER_ID] [--json]
//! geotorget status [--json]
//! geotorget config show|init
//! ```
//!
//! Logs go to stderr; `-v` enables info, `-vv` debug. `RUST_LOG` wins when set.

mod commands;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use commands::{check::CheckArgs, config::ConfigCommand, status::StatusArgs, sync::SyncArgs};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "geotorget",
    version,
    about = "Download and keep Geotorget orders up to date",
    long_about = None,
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download an order, or every subscribed order, into the output root.
    Sync(SyncArgs),

    /// Check whether orders have a newer remote release.
    Check(CheckArgs),

    /// List local orders and their last sync.
    Status(StatusArgs),

    /// Show or create ~/.geotorget/config.yaml.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Commands::Sync(args) => args.run().await,
        Commands::Check(args) => args.run().await,
        Commands::Status(args) => args.run(),
        Commands::Config { command } => commands::config::run(command),
    }
}

fn init_tracing(verbose: u8) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
