//! Mirroring the child's termination onto the runtime process.

use nix::sys::signal::{self, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::WaitStatus;

/// How the contained process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Normal exit with this code.
    Exited(i32),
    /// Killed by this signal.
    Signaled(Signal),
}

impl ExitDisposition {
    /// Interprets a wait status; `None` while the process is still alive.
    #[must_use]
    pub const fn from_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(Self::Exited(code)),
            WaitStatus::Signaled(_, sig, _) => Some(Self::Signaled(sig)),
            _ => None,
        }
    }

    /// The shell-style exit code: the code itself, or 128 plus the signal
    /// number.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(sig) => 128 + sig as i32,
        }
    }

    /// Terminates the current process the way the child terminated: with
    /// the same exit code, or killed by the same signal.
    pub fn mirror(self) -> ! {
        if let Self::Signaled(sig) = self {
            // SAFETY: restoring the default disposition installs no handler.
            if let Err(e) = unsafe { signal::signal(sig, SigHandler::SigDfl) } {
                tracing::debug!(signal = ?sig, error = %e, "could not reset disposition");
            }
            let mut set = SigSet::empty();
            set.add(sig);
            let _ = signal::sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None);
            let _ = signal::raise(sig);
        }
        std::process::exit(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn exit_code_is_kept() {
        let d = ExitDisposition::from_status(WaitStatus::Exited(Pid::from_raw(1), 7));
        assert_eq!(d, Some(ExitDisposition::Exited(7)));
        assert_eq!(d.map(ExitDisposition::code), Some(7));
    }

    #[test]
    fn signal_code_is_offset() {
        let d = ExitDisposition::from_status(WaitStatus::Signaled(
            Pid::from_raw(1),
            Signal::SIGKILL,
            false,
        ));
        assert_eq!(d, Some(ExitDisposition::Signaled(Signal::SIGKILL)));
        assert_eq!(d.map(ExitDisposition::code), Some(137));
    }

    #[test]
    fn live_process_has_no_disposition() {
        assert_eq!(ExitDisposition::from_status(WaitStatus::StillAlive), None);
    }
}
