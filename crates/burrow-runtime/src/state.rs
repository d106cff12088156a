//! Pid records of named containers.
//!
//! A record is a file named after the container in the runtime directory,
//! holding the supervising child's pid followed by a newline. The starting
//! side writes and removes it through a directory descriptor opened before
//! the root switch, when the runtime directory is no longer reachable by
//! path.

use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use burrow_common::error::{BurrowError, Result};
use nix::fcntl::{OFlag, open, openat};
use nix::sys::stat::Mode;
use nix::unistd::{Pid, UnlinkatFlags, unlinkat};

/// Renders the record contents.
#[must_use]
pub fn render_record(pid: Pid) -> String {
    format!("{pid}\n")
}

/// Parses record contents.
///
/// # Errors
///
/// Returns an error if the contents are not a positive decimal pid.
pub fn parse_record(contents: &str) -> Result<Pid> {
    contents
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(Pid::from_raw)
        .ok_or_else(|| BurrowError::Config {
            message: format!("malformed pid record: {contents:?}"),
        })
}

/// Reads the pid of the running container `name`.
///
/// # Errors
///
/// Returns [`BurrowError::NotFound`] when no such container runs, or an
/// error if the record cannot be read or parsed.
pub fn read_record(runtime_dir: &Path, name: &str) -> Result<Pid> {
    let path = runtime_dir.join(name);
    let contents = match std::fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BurrowError::NotFound {
                kind: "running container",
                id: name.to_string(),
            });
        }
        Err(e) => return Err(BurrowError::io(path, e)),
    };
    parse_record(&contents)
}

/// Open handle on the runtime directory.
#[derive(Debug)]
pub struct RecordDir {
    fd: OwnedFd,
    path: PathBuf,
}

impl RecordDir {
    /// Creates the runtime directory if needed and opens it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or opened.
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path).map_err(|e| BurrowError::io(path, e))?;
        let fd = open(
            path,
            OFlag::O_DIRECTORY | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(|e| BurrowError::syscall(format!("open({})", path.display()), e))?;
        Ok(Self {
            fd,
            path: path.to_path_buf(),
        })
    }

    /// Writes the record for `name`, replacing a stale one.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    pub fn write(self, name: &str, pid: Pid) -> Result<PidRecord> {
        let contents = render_record(pid);
        let fd = openat(
            &self.fd,
            name,
            OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_CLOEXEC,
            Mode::from_bits_truncate(0o644),
        )
        .map_err(|e| BurrowError::syscall(format!("open({})", self.path.join(name).display()), e))?;
        let file = std::fs::File::from(fd);
        std::io::Write::write_all(&mut &file, contents.as_bytes())
            .map_err(|e| BurrowError::io(self.path.join(name), e))?;
        tracing::debug!(name, %pid, "pid record written");
        Ok(PidRecord {
            dir: self,
            name: name.to_string(),
        })
    }
}

/// A written pid record, removed when dropped.
#[derive(Debug)]
pub struct PidRecord {
    dir: RecordDir,
    name: String,
}

impl Drop for PidRecord {
    fn drop(&mut self) {
        if let Err(e) = unlinkat(&self.dir.fd, self.name.as_str(), UnlinkatFlags::NoRemoveDir) {
            tracing::warn!(name = %self.name, error = %e, "could not remove pid record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_pid_and_newline() {
        assert_eq!(render_record(Pid::from_raw(4242)), "4242\n");
        assert_eq!(parse_record("4242\n").expect("parse"), Pid::from_raw(4242));
    }

    #[test]
    fn malformed_records_are_rejected() {
        for bad in ["", "abc", "-1", "0\n"] {
            assert!(parse_record(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn write_read_and_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runtime = dir.path().join("burrow");
        let record = RecordDir::open(&runtime)
            .expect("open")
            .write("web", Pid::from_raw(77))
            .expect("write");

        assert_eq!(
            std::fs::read_to_string(runtime.join("web")).expect("read"),
            "77\n"
        );
        assert_eq!(read_record(&runtime, "web").expect("record"), Pid::from_raw(77));

        drop(record);
        assert!(!runtime.join("web").exists());
    }

    #[test]
    fn stale_record_is_replaced() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("web"), "123456789\n").expect("stale");
        let record = RecordDir::open(dir.path())
            .expect("open")
            .write("web", Pid::from_raw(8))
            .expect("write");
        assert_eq!(read_record(dir.path(), "web").expect("record"), Pid::from_raw(8));
        drop(record);
        assert!(!dir.path().join("web").exists());
    }

    #[test]
    fn missing_record_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = read_record(dir.path(), "ghost").expect_err("no record");
        assert!(matches!(err, BurrowError::NotFound { .. }), "{err}");
    }
}
