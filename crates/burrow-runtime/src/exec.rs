//! Joining a running container.

use std::path::Path;

use burrow_common::error::{BurrowError, Result};
use burrow_core::namespace::NamespaceSet;
use burrow_core::namespace::pidfd::PidFd;

use crate::process;
use crate::state::read_record;
use crate::supervisor::exit::ExitDisposition;
use crate::supervisor::{self, terminal};

/// Runs `command` inside the running container `name` and supervises it.
///
/// The new process shares the container's namespaces, filesystem and
/// network; nothing is set up again.
///
/// # Errors
///
/// Returns an error if the container is not running, its namespaces
/// cannot be entered, or supervision breaks down.
pub fn join(
    runtime_dir: &Path,
    name: &str,
    command: &[String],
    env: &[(String, String)],
) -> Result<ExitDisposition> {
    let pid = read_record(runtime_dir, name)?;
    let target = PidFd::open(pid)?;
    let namespaces = NamespaceSet::of_process(target.pid())?;
    target.enter(namespaces)?;
    tracing::info!(name, %pid, "joined container");

    let terminal = terminal::capture()?;
    let child = process::spawn(terminal.as_ref(), || {
        nix::unistd::chdir("/").map_err(|e| BurrowError::syscall("chdir(/)", e))?;
        process::exec(command, env)
    })?;
    supervisor::supervise(child, terminal.as_ref(), None)
}
