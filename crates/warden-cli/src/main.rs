mod bootstrap;
mod cli_args;
mod commands;

use anyhow::{Context, Result};
use clap::Parser;

use crate::bootstrap::init_tracing;
use crate::cli_args::Cli;
use crate::commands::execute_command;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let output = execute_command(&cli).await?;
    let rendered = serde_json::to_string_pretty(&output).context("failed to render output")?;
    println!("{rendered}");
    Ok(())
}
