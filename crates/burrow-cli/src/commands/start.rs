//! `burrow start`: create a container and run a command in it.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use anyhow::Context;
use burrow_common::config::RuntimeConfig;
use burrow_common::types::{BindMount, ContainerSpec, MacAddr, NetworkSpec, parse_env_pair};
use burrow_runtime::container;
use burrow_runtime::supervisor::exit::ExitDisposition;
use clap::{Args, Parser};

use crate::config::load_section;

/// Arguments for the `start` command.
#[derive(Args, Debug, Default, Clone, PartialEq, Eq)]
#[command(args_override_self = true)]
pub struct StartArgs {
    /// Layer directory, bottom to top; the last one receives the writes.
    /// Relative paths live under the layer storage.
    #[arg(short, long = "overlay", value_name = "PATH")]
    pub overlays: Vec<PathBuf>,

    /// Environment variable of the command.
    #[arg(short, long = "env", value_name = "FOO=BAR", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Throw every modification away when the container exits.
    #[arg(short = 'E', long)]
    pub ephemeral: bool,

    /// Give the container its own network, with a macvlan on INTERFACE
    /// configured over DHCP.
    #[arg(long, value_name = "INTERFACE")]
    pub net: Option<String>,

    /// Hardware address of the macvlan.
    #[arg(long, value_name = "MAC")]
    pub mac: Option<MacAddr>,

    /// Name server to use instead of the ones offered over DHCP.
    #[arg(long, value_name = "ADDR")]
    pub dns: Option<Ipv4Addr>,

    /// Bind the host path FROM to TO in the container.
    #[arg(long = "bind", value_name = "FROM[:TO]")]
    pub binds: Vec<BindMount>,

    /// Directory to run the command from.
    #[arg(short = 'C', long, value_name = "PATH")]
    pub directory: Option<PathBuf>,

    /// Command to run.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Parser, Debug)]
#[command(args_override_self = true)]
struct StartFile {
    #[command(flatten)]
    args: StartArgs,
}

impl StartArgs {
    /// Applies these command-line arguments on top of those from the
    /// container's file: lists accumulate, single values and the command
    /// are replaced when given.
    #[must_use]
    pub fn over(self, file: Self) -> Self {
        Self {
            overlays: file.overlays.into_iter().chain(self.overlays).collect(),
            env: file.env.into_iter().chain(self.env).collect(),
            ephemeral: file.ephemeral || self.ephemeral,
            net: self.net.or(file.net),
            mac: self.mac.or(file.mac),
            dns: self.dns.or(file.dns),
            binds: file.binds.into_iter().chain(self.binds).collect(),
            directory: self.directory.or(file.directory),
            command: if self.command.is_empty() {
                file.command
            } else {
                self.command
            },
        }
    }

    /// Builds the container description.
    ///
    /// # Errors
    ///
    /// Returns an error if a bind source does not exist.
    pub fn into_spec(
        self,
        config: &RuntimeConfig,
        name: Option<String>,
    ) -> anyhow::Result<ContainerSpec> {
        let mut layers: Vec<PathBuf> = self
            .overlays
            .iter()
            .map(|p| config.layer_path(p))
            .collect();
        let upper = layers.pop().unwrap_or_default();

        if self.net.is_none() && (self.mac.is_some() || self.dns.is_some()) {
            tracing::warn!("--mac and --dns only apply together with --net");
        }
        let network = self.net.map(|parent| NetworkSpec {
            parent,
            mac: self.mac,
            dns: self.dns,
        });

        let binds = self
            .binds
            .into_iter()
            .map(|b| {
                let from = std::fs::canonicalize(&b.from)
                    .with_context(|| format!("bind source {}", b.from.display()))?;
                Ok(BindMount { from, to: b.to })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(ContainerSpec {
            layers,
            upper,
            ephemeral: self.ephemeral,
            network,
            binds,
            workdir: self.directory,
            command: self.command,
            env: self.env,
            name,
        })
    }
}

/// Executes the `start` command.
///
/// # Errors
///
/// Returns an error if the arguments are invalid or the container cannot
/// be started.
pub fn execute(
    args: StartArgs,
    config: &RuntimeConfig,
    name: Option<String>,
) -> anyhow::Result<ExitDisposition> {
    let args = match &name {
        Some(n) => {
            let file_args = load_section(&config.layer_dir, n, "start")?;
            let file: StartFile = super::parse_file_args("start", file_args)?;
            args.over(file.args)
        }
        None => args,
    };
    let spec = args.into_spec(config, name)?;
    container::start(&spec, config).context("container failed")
}
