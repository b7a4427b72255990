//! Oncall Lens CLI: analyze incident artifacts against past postmortems.
//!
//! Runs the staged analysis pipeline locally, following its progress the
//! same way a streaming client would.

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
