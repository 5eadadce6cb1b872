//! Sidekick benchmark driver
//!
//! - `run`: builds the emulated path, runs trials of one protocol (or two
//!   concurrent flows) and tears everything down again
//! - `harvest`: parses accumulated logs, reports missing trials, optionally
//!   backfills them by re-invoking `run`, and writes per-condition summaries
//! - `cwnd`: congestion window time series from client or `ss` logs

mod cwnd;
mod executor;
mod harvest;
mod run;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Protocol benchmarks over an emulated client–relay–server path.
#[derive(Parser, Debug)]
#[command(name = "sidekick-bench", about = "Emulated-path protocol benchmarks")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run trials on a freshly built emulated network.
    Run(run::RunArgs),
    /// Parse logs, reconcile missing trials and summarise.
    Harvest(harvest::HarvestArgs),
    /// Summarise congestion window logs.
    Cwnd(cwnd::CwndArgs),
}

fn main() -> anyhow::Result<()> {
    // stdout carries benchmark output that is parsed back later.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run::run(args),
        Command::Harvest(args) => harvest::run(args),
        Command::Cwnd(args) => cwnd::run(args),
    }
}
