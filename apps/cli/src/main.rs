//! RecordFlow CLI: batch enrichment of directory-style business records.
//!
//! Resolves each record against a business directory, crawls its website,
//! and hands the result to external research and synthesis services, with
//! a resumable checkpoint.

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
