//! lodestar CLI - replay notebook sessions through the execution engine.

mod replay;
mod scenario;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use lodestar_core::config::DEFAULT_FINALIZE_DELAY;

#[derive(Parser)]
#[command(name = "lodestar")]
#[command(about = "Replay notebook sessions through the lodestar engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario and print the final notebook state as JSON
    Replay {
        /// Path to the scenario (.json file)
        script: PathBuf,

        /// Delay between idle and ending an execution, in milliseconds
        #[arg(long, default_value_t = DEFAULT_FINALIZE_DELAY.as_millis() as u64)]
        finalize_delay_ms: u64,
    },

    /// Validate a scenario without running it
    Check {
        /// Path to the scenario (.json file)
        script: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries the report.
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Replay {
            script,
            finalize_delay_ms,
        } => replay::execute(&script, finalize_delay_ms).await?,

        Commands::Check { script } => replay::check(&script).await?,
    }

    Ok(())
}
