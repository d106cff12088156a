//! CLI command definitions and dispatch.

pub mod exec;
pub mod start;

use std::path::PathBuf;

use burrow_common::config::RuntimeConfig;
use burrow_runtime::supervisor::exit::ExitDisposition;
use clap::{Parser, Subcommand};

/// burrow: lightweight unprivileged containers.
#[derive(Parser, Debug)]
#[command(name = "burrow", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Where layers are stored. Defaults to $LAYERPATH, then
    /// $XDG_DATA_HOME/burrow.
    #[arg(short, long, global = true, value_name = "PATH")]
    pub layer: Option<PathBuf>,

    /// Container name: hostname with --net, pid record and argument file.
    #[arg(short, long, global = true, value_name = "NAME")]
    pub name: Option<String>,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a container and run a command in it.
    Start(start::StartArgs),
    /// Run a command inside a running named container.
    Exec(exec::ExecArgs),
}

/// Dispatches the parsed CLI command and returns how the contained
/// program ended.
///
/// # Errors
///
/// Returns an error if the command cannot be carried out.
pub fn execute(cli: Cli) -> anyhow::Result<ExitDisposition> {
    let config = RuntimeConfig::from_env(cli.layer);
    tracing::debug!(layer_dir = %config.layer_dir.display(), "configuration resolved");
    match cli.command {
        Command::Start(args) => start::execute(args, &config, cli.name),
        Command::Exec(args) => exec::execute(args, &config, cli.name),
    }
}

/// Parses `args` for `subcommand` as if they had been given on the command
/// line.
fn parse_file_args<P: Parser>(subcommand: &str, args: Vec<String>) -> anyhow::Result<P> {
    let argv = std::iter::once(format!("burrow-{subcommand}")).chain(args);
    P::try_parse_from(argv)
        .map_err(|e| anyhow::anyhow!("invalid [{subcommand}] section: {e}"))
}
