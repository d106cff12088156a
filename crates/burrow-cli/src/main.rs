//! # burrow
//!
//! Lightweight unprivileged containers: layered root filesystems, an
//! optional private network with DHCP, and a supervisor that makes the
//! container behave like the program it runs.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

mod commands;
mod config;

use burrow_common::constants::{BIN_NAME, FATAL_EXIT_CODE};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::commands::Cli;

#[allow(clippy::print_stderr)]
fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match commands::execute(cli) {
        Ok(exit) => exit.mirror(),
        Err(e) => {
            eprintln!("{BIN_NAME}: {e:#}");
            std::process::exit(FATAL_EXIT_CODE);
        }
    }
}
