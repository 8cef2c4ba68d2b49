//! Courier CLI: content relay pipeline.
//!
//! Discovers items from configured sources, runs them through ordered
//! enrichment stages, and delivers each finished item once per destination.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
