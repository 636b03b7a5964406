//! edgewise - validate flow definitions and dry-run flows locally.

mod commands;
mod error;

use clap::{Parser, Subcommand};
use error::CliError;
use rootcause::Report;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Dependency-graph flow dispatcher tooling.
#[derive(Parser)]
#[command(name = "edgewise")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a system definition and describe its flows
    Check {
        /// Path to the system definition YAML file
        definition: PathBuf,

        /// Also print each flow graph in Graphviz dot format
        #[arg(long)]
        dot: bool,
    },

    /// Run a flow in memory, completing every node with its own arguments
    DryRun {
        /// Path to the system definition YAML file
        definition: PathBuf,

        /// Flow to run
        #[arg(short, long)]
        flow: String,

        /// Flow arguments as JSON
        #[arg(short, long)]
        args: Option<String>,

        /// Give up after this many dispatch cycles
        #[arg(long, default_value = "100", env = "EDGEWISE_MAX_CYCLES")]
        max_cycles: u32,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("{report}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Report<CliError>> {
    match cli.command {
        Commands::Check { definition, dot } => {
            let config = commands::load(&definition)?;
            print!("{}", commands::summary(&config, dot));
        }
        Commands::DryRun {
            definition,
            flow,
            args,
            max_cycles,
        } => {
            let config = commands::load(&definition)?;
            let node_args = commands::parse_args(args.as_deref())?;
            for line in commands::dry_run(config, &flow, node_args, max_cycles).await? {
                println!("{line}");
            }
        }
    }
    Ok(())
}
