//! Stable process handles for re-entering a running container.

use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd};

use burrow_common::error::{BurrowError, Result};
use nix::unistd::Pid;

use super::NamespaceSet;

/// A pidfd: a handle on a process that stays bound to it even if the
/// numeric id is recycled after it exits.
#[derive(Debug)]
pub struct PidFd {
    fd: OwnedFd,
    pid: Pid,
}

impl PidFd {
    /// Opens a pidfd for `pid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process does not exist (anymore) or the
    /// kernel lacks `pidfd_open(2)`.
    pub fn open(pid: Pid) -> Result<Self> {
        // SAFETY: pidfd_open takes a pid and a flags word and returns a new
        // descriptor or -1; no memory is shared with the kernel.
        let raw = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
        if raw < 0 {
            return Err(BurrowError::last_os_error(format!("pidfd_open({pid})")));
        }
        let raw = i32::try_from(raw).map_err(|_| BurrowError::Config {
            message: format!("pidfd_open returned an out-of-range descriptor: {raw}"),
        })?;
        // SAFETY: the kernel just handed us ownership of this descriptor,
        // which pidfd_open always creates close-on-exec.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd, pid })
    }

    /// The process id this handle was opened for.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Moves the calling process into the namespaces of the target.
    ///
    /// All namespaces are switched in one `setns(2)` call, so the caller
    /// never observes a half-joined state. The PID namespace applies to
    /// children forked afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if the process has exited or any namespace cannot
    /// be entered.
    pub fn enter(&self, namespaces: NamespaceSet) -> Result<()> {
        nix::sched::setns(self.fd.as_fd(), namespaces.flags())
            .map_err(|e| BurrowError::syscall(format!("setns(pid {})", self.pid), e))?;
        tracing::debug!(pid = %self.pid, "joined container namespaces");
        Ok(())
    }
}

impl AsFd for PidFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
