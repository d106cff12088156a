//! The runtime must end exactly the way its child ended.

#![allow(unsafe_code, clippy::expect_used)]

use burrow_runtime::supervisor::exit::ExitDisposition;
use nix::sys::signal::Signal;
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork};

/// Forks a process that mirrors `disposition` and returns what its parent
/// observes.
fn observe(disposition: ExitDisposition) -> WaitStatus {
    // SAFETY: the child only mirrors the disposition, which ends it.
    match unsafe { fork() }.expect("fork") {
        ForkResult::Child => disposition.mirror(),
        ForkResult::Parent { child } => waitpid(child, None).expect("waitpid"),
    }
}

#[test]
fn exit_code_seven_is_observed_as_seven() {
    assert!(matches!(
        observe(ExitDisposition::Exited(7)),
        WaitStatus::Exited(_, 7)
    ));
}

#[test]
fn sigkill_is_observed_as_sigkill() {
    assert!(matches!(
        observe(ExitDisposition::Signaled(Signal::SIGKILL)),
        WaitStatus::Signaled(_, Signal::SIGKILL, _)
    ));
}

#[test]
fn caught_signal_is_raised_with_default_disposition() {
    assert!(matches!(
        observe(ExitDisposition::Signaled(Signal::SIGTERM)),
        WaitStatus::Signaled(_, Signal::SIGTERM, _)
    ));
}
