//! Kestrel CLI

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::filter::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "kestrel",
    version,
    about = "Run JavaScript functions through the Kestrel tiers",
    propagate_version = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Trace compilation, bailouts and tier changes
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a function expression and call it
    Run(commands::run::RunCommand),

    /// Print the optimized graph and region table
    Graph(commands::graph::GraphCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG still wins over the default level
    let level = if cli.verbose { "trace" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.parse()?))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(cmd) => cmd.run(),
        Commands::Graph(cmd) => cmd.run(),
    }
}
