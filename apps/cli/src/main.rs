//! `tenderwatch` binary.
//!
//! Screens public procurement and spending archives for counterparties of
//! PRC, Taiwan, Hong Kong and Macao origin. `run` ingests new archives and
//! refreshes the report tree; `analyze`, `correct` and `checkpoint` work on
//! the persisted state between runs.
//!
//! Exit status: 0 on success, 3 when a `run` left archives failed or was
//! interrupted, 1 on any other error.

mod commands;

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::Result;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = commands::Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
