//! Forking and executing the contained program.

use std::convert::Infallible;
use std::ffi::CString;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use burrow_common::constants::{BIN_NAME, DEFAULT_PATH, FATAL_EXIT_CODE};
use burrow_common::error::{BurrowError, Result};
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::pty::{OpenptyResult, Winsize, openpty};
use nix::sys::termios::Termios;
use nix::unistd::{ForkResult, Pid, fork};

/// Finds the executable `program` would run as.
///
/// Names containing a `/` are used as they are; others are looked up in
/// the `PATH` of `env`, or in [`DEFAULT_PATH`] when it defines none.
#[must_use]
pub fn resolve_program(
    program: &str,
    env: &[(String, String)],
    is_executable: impl Fn(&Path) -> bool,
) -> PathBuf {
    if program.contains('/') {
        return PathBuf::from(program);
    }
    let search = env
        .iter()
        .find(|(k, _)| k == "PATH")
        .map_or(DEFAULT_PATH, |(_, v)| v.as_str());
    search
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| is_executable(candidate))
        .unwrap_or_else(|| PathBuf::from(program))
}

/// True for a regular file with an execute bit set.
#[must_use]
pub fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Replaces the current process with `command`, whose environment is
/// exactly `env`.
///
/// # Errors
///
/// Returns an error if an argument contains a NUL byte or `execve(2)`
/// fails.
pub fn exec(command: &[String], env: &[(String, String)]) -> Result<Infallible> {
    let Some(program) = command.first() else {
        return Err(BurrowError::Config {
            message: "no command to execute".into(),
        });
    };
    let path = resolve_program(program, env, is_executable);
    let nul = |s: &[u8]| {
        CString::new(s).map_err(|_| BurrowError::Config {
            message: format!("argument contains a NUL byte: {}", String::from_utf8_lossy(s)),
        })
    };
    let c_path = nul(path.as_os_str().as_encoded_bytes())?;
    let argv = command
        .iter()
        .map(|a| nul(a.as_bytes()))
        .collect::<Result<Vec<_>>>()?;
    let envp = env
        .iter()
        .map(|(k, v)| nul(format!("{k}={v}").as_bytes()))
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!(program = %path.display(), "executing");
    nix::unistd::execve(&c_path, &argv, &envp)
        .map_err(|e| BurrowError::syscall(format!("execve({})", path.display()), e))
}

/// How the child's standard streams are wired to the supervisor.
#[derive(Debug)]
pub enum ChildIo {
    /// One pseudo-terminal carries all three streams.
    Pty {
        /// Supervisor side of the terminal.
        master: OwnedFd,
    },
    /// Three pipes. `stdin` becomes `None` once host input has ended.
    Pipes {
        /// Write end feeding the child's standard input.
        stdin: Option<OwnedFd>,
        /// Read end of the child's standard output.
        stdout: OwnedFd,
        /// Read end of the child's standard error.
        stderr: OwnedFd,
    },
}

/// A forked child and the supervisor's ends of its standard streams.
#[derive(Debug)]
pub struct Child {
    /// Process id, in the supervisor's PID namespace.
    pub pid: Pid,
    /// Supervisor side of the child's stdio.
    pub io: ChildIo,
}

/// Terminal settings the child's pseudo-terminal starts with.
#[derive(Debug, Clone)]
pub struct TerminalSetup {
    /// Host terminal attributes.
    pub termios: Termios,
    /// Host window size.
    pub winsize: Winsize,
}

enum Prepared {
    Pty(OpenptyResult),
    Pipes {
        stdin: (OwnedFd, OwnedFd),
        stdout: (OwnedFd, OwnedFd),
        stderr: (OwnedFd, OwnedFd),
    },
}

impl Prepared {
    fn new(terminal: Option<&TerminalSetup>) -> Result<Self> {
        if let Some(t) = terminal {
            let pty = openpty(Some(&t.winsize), Some(&t.termios))
                .map_err(|e| BurrowError::syscall("openpty", e))?;
            return Ok(Self::Pty(pty));
        }
        let pipe =
            || nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| BurrowError::syscall("pipe2", e));
        Ok(Self::Pipes {
            stdin: pipe()?,
            stdout: pipe()?,
            stderr: pipe()?,
        })
    }

    /// Child side: makes the prepared descriptors its stdio.
    fn connect_child(self) -> Result<()> {
        match self {
            Self::Pty(OpenptyResult { master, slave }) => {
                drop(master);
                nix::unistd::setsid().map_err(|e| BurrowError::syscall("setsid", e))?;
                // SAFETY: slave is an open terminal descriptor.
                if unsafe { libc::ioctl(slave.as_raw_fd(), libc::TIOCSCTTY, 0) } < 0 {
                    return Err(BurrowError::last_os_error("ioctl(TIOCSCTTY)"));
                }
                redirect(&slave, &slave, &slave)?;
                if slave.as_raw_fd() <= libc::STDERR_FILENO {
                    std::mem::forget(slave);
                }
            }
            Self::Pipes {
                stdin,
                stdout,
                stderr,
            } => {
                redirect(&stdin.0, &stdout.1, &stderr.1)?;
            }
        }
        Ok(())
    }

    /// Parent side: keeps the supervisor ends, non-blocking.
    fn into_parent(self, pid: Pid) -> Result<Child> {
        let io = match self {
            Self::Pty(OpenptyResult { master, slave }) => {
                drop(slave);
                set_nonblocking(&master)?;
                ChildIo::Pty { master }
            }
            Self::Pipes {
                stdin,
                stdout,
                stderr,
            } => {
                for fd in [&stdin.1, &stdout.0, &stderr.0] {
                    set_nonblocking(fd)?;
                }
                ChildIo::Pipes {
                    stdin: Some(stdin.1),
                    stdout: stdout.0,
                    stderr: stderr.0,
                }
            }
        };
        Ok(Child { pid, io })
    }
}

/// Forks a child wired to a pseudo-terminal (when `terminal` is given) or
/// to three pipes, and runs `child_main` in it.
///
/// `child_main` only returns on failure; the error is printed on the
/// child's standard error and the child exits with [`FATAL_EXIT_CODE`].
///
/// # Errors
///
/// Returns an error if the descriptors cannot be allocated or the fork
/// fails.
#[allow(clippy::print_stderr)]
pub fn spawn(
    terminal: Option<&TerminalSetup>,
    child_main: impl FnOnce() -> Result<Infallible>,
) -> Result<Child> {
    let prepared = Prepared::new(terminal)?;

    // SAFETY: the supervisor is single-threaded; the child only sets up its
    // descriptors and filesystem before executing.
    match unsafe { fork() }.map_err(|e| BurrowError::syscall("fork", e))? {
        ForkResult::Child => {
            let Err(err) = prepared.connect_child().and_then(|()| child_main());
            eprintln!("{BIN_NAME}: {err}");
            std::process::exit(FATAL_EXIT_CODE);
        }
        ForkResult::Parent { child } => {
            tracing::info!(pid = %child, tty = terminal.is_some(), "child started");
            prepared.into_parent(child)
        }
    }
}

fn redirect(stdin: impl AsFd, stdout: impl AsFd, stderr: impl AsFd) -> Result<()> {
    nix::unistd::dup2_stdin(stdin).map_err(|e| BurrowError::syscall("dup2(stdin)", e))?;
    nix::unistd::dup2_stdout(stdout).map_err(|e| BurrowError::syscall("dup2(stdout)", e))?;
    nix::unistd::dup2_stderr(stderr).map_err(|e| BurrowError::syscall("dup2(stderr)", e))
}

/// Sets `O_NONBLOCK` on `fd`.
///
/// # Errors
///
/// Returns an error if `fcntl(2)` fails.
pub fn set_nonblocking(fd: impl AsFd) -> Result<()> {
    let fd = fd.as_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(|e| BurrowError::syscall("fcntl(F_GETFL)", e))?;
    let flags = OFlag::from_bits_retain(flags) | OFlag::O_NONBLOCK;
    let _ = fcntl(fd, FcntlArg::F_SETFL(flags))
        .map_err(|e| BurrowError::syscall("fcntl(O_NONBLOCK)", e))?;
    Ok(())
}

/// A one-shot barrier the child waits on before executing.
///
/// In a networked container the program starts only once the first lease
/// is bound, so it never sees an unconfigured interface.
#[derive(Debug)]
pub struct ReadyGate {
    reader: OwnedFd,
    writer: OwnedFd,
}

impl ReadyGate {
    /// Creates the gate. Must be called before forking.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipe cannot be created.
    pub fn new() -> Result<Self> {
        let (reader, writer) =
            nix::unistd::pipe2(OFlag::O_CLOEXEC).map_err(|e| BurrowError::syscall("pipe2", e))?;
        Ok(Self { reader, writer })
    }

    /// Child side: blocks until the supervisor opens the gate.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor went away without opening it.
    pub fn wait(self) -> Result<()> {
        drop(self.writer);
        let mut byte = [0u8; 1];
        let mut reader = std::fs::File::from(self.reader);
        match std::io::Read::read(&mut reader, &mut byte) {
            Ok(1) => Ok(()),
            Ok(_) => Err(BurrowError::Config {
                message: "supervisor exited before the network came up".into(),
            }),
            Err(e) => Err(BurrowError::syscall("read(ready gate)", e)),
        }
    }

    /// Parent side: keeps the opening end.
    #[must_use]
    pub fn into_opener(self) -> GateOpener {
        drop(self.reader);
        GateOpener(Some(self.writer))
    }
}

/// Parent end of a [`ReadyGate`].
#[derive(Debug)]
pub struct GateOpener(Option<OwnedFd>);

impl GateOpener {
    /// Opens the gate. Later calls do nothing.
    pub fn open(&mut self) {
        if let Some(fd) = self.0.take() {
            let mut writer = std::fs::File::from(fd);
            if let Err(e) = std::io::Write::write_all(&mut writer, &[1]) {
                tracing::warn!(error = %e, "could not release the child");
            }
        }
    }

    /// True until [`GateOpener::open`] has been called.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.0.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn slash_means_no_lookup() {
        let path = resolve_program("./run.sh", &[], |_| true);
        assert_eq!(path, PathBuf::from("./run.sh"));
    }

    #[test]
    fn lookup_follows_container_path() {
        let env = env(&[("PATH", "/opt/bin:/bin")]);
        let path = resolve_program("sh", &env, |p| p == Path::new("/bin/sh"));
        assert_eq!(path, PathBuf::from("/bin/sh"));
    }

    #[test]
    fn lookup_defaults_without_path() {
        let path = resolve_program("ls", &[], |p| p == Path::new("/usr/bin/ls"));
        assert_eq!(path, PathBuf::from("/usr/bin/ls"));
    }

    #[test]
    fn unknown_program_is_left_for_execve_to_reject() {
        let path = resolve_program("nope", &[], |_| false);
        assert_eq!(path, PathBuf::from("nope"));
    }

    #[test]
    fn gate_releases_the_waiter() {
        let gate = ReadyGate::new().expect("gate");
        let reader = ReadyGate {
            reader: gate.reader.try_clone().expect("dup"),
            writer: gate.writer.try_clone().expect("dup"),
        };
        let mut opener = gate.into_opener();
        assert!(opener.is_closed());
        opener.open();
        assert!(!opener.is_closed());
        reader.wait().expect("opened");
    }

    #[test]
    fn dropped_gate_fails_the_waiter() {
        let gate = ReadyGate::new().expect("gate");
        let waiter = ReadyGate {
            reader: gate.reader.try_clone().expect("dup"),
            writer: gate.writer.try_clone().expect("dup"),
        };
        drop(gate);
        assert!(waiter.wait().is_err());
    }
}
