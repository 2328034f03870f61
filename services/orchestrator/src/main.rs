//! nodeorch - node lifecycle CLI
//!
//! Thin presentation layer over the orchestrator library: lists nodes and
//! bundles, activates and deactivates nodes, installs bundles and tails
//! notices.

use anyhow::Result;
use clap::Parser;

mod commands;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        output::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
