//! fshandle Command Line Interface
//!
//! Drives the handle lifecycle library from the command line.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};

mod commands;

/// fshandle - filesystem handle duplicate, clone and merge
#[derive(Parser)]
#[command(
    name = "fshandle",
    about = "fshandle command-line interface",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone a volume handle across worker threads and verify the merged result
    Stress(commands::stress::StressArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        LevelFilter::Debug
    } else if cli.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };

    env_logger::Builder::new()
        .filter_level(log_level)
        .init();

    info!("fshandle CLI v{} starting...", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Stress(args) => commands::stress::run(args).await,
    }
}
