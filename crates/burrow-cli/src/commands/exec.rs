//! `burrow exec`: run a command inside a running container.

use anyhow::Context;
use burrow_common::config::RuntimeConfig;
use burrow_common::types::parse_env_pair;
use burrow_runtime::exec::join;
use burrow_runtime::supervisor::exit::ExitDisposition;
use clap::{Args, Parser};

use crate::config::load_section;

/// Arguments for the `exec` command.
#[derive(Args, Debug, Default, Clone, PartialEq, Eq)]
pub struct ExecArgs {
    /// Environment variable of the command.
    #[arg(short, long = "env", value_name = "FOO=BAR", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Command to run.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Parser, Debug)]
struct ExecFile {
    #[command(flatten)]
    args: ExecArgs,
}

impl ExecArgs {
    /// Applies these command-line arguments on top of those from the
    /// container's file.
    #[must_use]
    pub fn over(self, file: Self) -> Self {
        Self {
            env: file.env.into_iter().chain(self.env).collect(),
            command: if self.command.is_empty() {
                file.command
            } else {
                self.command
            },
        }
    }
}

/// Executes the `exec` command.
///
/// # Errors
///
/// Returns an error if no name is given, the container is not running, or
/// the command cannot be run inside it.
pub fn execute(
    args: ExecArgs,
    config: &RuntimeConfig,
    name: Option<String>,
) -> anyhow::Result<ExitDisposition> {
    let name = name.context("exec needs the --name of a running container")?;
    let file_args = load_section(&config.layer_dir, &name, "exec")?;
    let file: ExecFile = super::parse_file_args("exec", file_args)?;
    let args = args.over(file.args);
    if args.command.is_empty() {
        anyhow::bail!("no command to execute");
    }
    join(&config.runtime_dir, &name, &args.command, &args.env)
        .with_context(|| format!("could not run in container {name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ExecArgs {
        ExecFile::try_parse_from(std::iter::once("exec").chain(args.iter().copied()))
            .expect("parse")
            .args
    }

    #[test]
    fn file_environment_comes_first() {
        let merged = parse(&["-e", "B=2", "ps"]).over(parse(&["--env=A=1"]));
        assert_eq!(
            merged.env,
            vec![("A".into(), "1".into()), ("B".into(), "2".into())]
        );
        assert_eq!(merged.command, vec!["ps"]);
    }

    #[test]
    fn exec_requires_a_name() {
        let config = RuntimeConfig {
            layer_dir: "/nonexistent".into(),
            runtime_dir: "/nonexistent".into(),
        };
        let err = execute(parse(&["sh"]), &config, None).expect_err("no name");
        assert!(err.to_string().contains("--name"));
    }

    #[test]
    fn stopped_container_cannot_be_joined() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = RuntimeConfig {
            layer_dir: dir.path().join("layers"),
            runtime_dir: dir.path().join("run"),
        };
        let err = execute(parse(&["sh"]), &config, Some("ghost".into())).expect_err("not running");
        assert!(format!("{err:#}").contains("not found"), "{err:#}");
    }
}
