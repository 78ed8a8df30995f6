//! Importer CLI: runs the recurring multi-step import job in the foreground.
//!
//! Imports start at launch, on a fixed interval and on demand from stdin.

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
