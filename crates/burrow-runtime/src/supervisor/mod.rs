//! Process supervision.
//!
//! The supervisor relays the child's standard streams to the host, forwards
//! signals, drives DHCP for networked containers and reports how the child
//! ended. Everything happens on one thread in one `poll(2)` loop; the set
//! of descriptors polled is rebuilt from the relay state on every turn, so a
//! direction whose buffer is full is not read until it has been written out.

pub mod exit;
pub mod network;
pub mod relay;
pub mod terminal;

use std::os::fd::{AsFd, BorrowedFd};

use burrow_common::error::{BurrowError, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{self, SigSet, SigmaskHow, Signal};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::wait::{WaitPidFlag, waitpid};
use nix::unistd::Pid;

use crate::process::{Child, ChildIo, TerminalSetup};
use exit::ExitDisposition;
use network::Network;
use relay::{FdStream, InterruptDetector, Relay, Transfer};
use terminal::RawModeGuard;

/// Supervises `child` until it terminates.
///
/// With `terminal`, the host terminal is switched to raw mode for the
/// duration and restored afterwards. `network` is given for containers
/// with their own network namespace.
///
/// # Errors
///
/// Returns an error if the loop itself fails; the child is killed and
/// reaped before returning.
pub fn supervise(
    child: Child,
    terminal: Option<&TerminalSetup>,
    network: Option<Network>,
) -> Result<ExitDisposition> {
    let pid = child.pid;
    let result = SignalMask::block_all().and_then(|mask| {
        let _raw = match (&child.io, terminal) {
            (ChildIo::Pty { .. }, Some(t)) => Some(RawModeGuard::enter(&t.termios)?),
            _ => None,
        };
        Supervisor::new(child, mask, network).run()
    });
    if result.is_err() {
        let _ = signal::kill(pid, Signal::SIGKILL);
        let _ = waitpid(pid, None);
    }
    result
}

/// All signals blocked and delivered through a descriptor instead; the
/// previous mask is restored on drop.
struct SignalMask {
    previous: SigSet,
    fd: SignalFd,
}

impl SignalMask {
    fn block_all() -> Result<Self> {
        let mut previous = SigSet::empty();
        signal::sigprocmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut previous))
            .map_err(|e| BurrowError::syscall("sigprocmask", e))?;
        let fd = SignalFd::with_flags(&SigSet::all(), SfdFlags::SFD_CLOEXEC | SfdFlags::SFD_NONBLOCK)
            .map_err(|e| BurrowError::syscall("signalfd", e))?;
        Ok(Self { previous, fd })
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        let _ = signal::sigprocmask(SigmaskHow::SIG_SETMASK, Some(&self.previous), None);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Signals,
    HostIn,
    HostOut,
    HostErr,
    ChildIn,
    ChildOut,
    ChildErr,
    Dhcp,
    Timer,
}

struct Supervisor {
    pid: Pid,
    io: ChildIo,
    signals: SignalMask,
    network: Option<Network>,
    to_child: Relay,
    to_stdout: Relay,
    to_stderr: Relay,
    interrupt: InterruptDetector,
    host_in_open: bool,
    child_in_open: bool,
    child_out_open: bool,
    child_err_open: bool,
}

impl Supervisor {
    fn new(child: Child, signals: SignalMask, network: Option<Network>) -> Self {
        let has_stderr = matches!(child.io, ChildIo::Pipes { .. });
        Self {
            pid: child.pid,
            io: child.io,
            signals,
            network,
            to_child: Relay::default(),
            to_stdout: Relay::default(),
            to_stderr: Relay::default(),
            interrupt: InterruptDetector::default(),
            host_in_open: true,
            child_in_open: true,
            child_out_open: true,
            child_err_open: has_stderr,
        }
    }

    fn run(mut self) -> Result<ExitDisposition> {
        // The child may have ended before its SIGCHLD could be captured.
        if let Some(exit) = self.reap()? {
            return Ok(self.finish(exit));
        }
        loop {
            for source in self.wait_ready()? {
                if let Some(exit) = self.dispatch(source)? {
                    return Ok(self.finish(exit));
                }
            }
        }
    }

    fn interest(&self) -> Vec<(Source, BorrowedFd<'_>, PollFlags)> {
        let mut interest = vec![(Source::Signals, self.signals.fd.as_fd(), PollFlags::POLLIN)];
        if self.host_in_open && self.to_child.is_empty() {
            interest.push((Source::HostIn, terminal::host_stdin(), PollFlags::POLLIN));
        }
        if self.child_in_open && !self.to_child.is_empty() {
            if let Some(fd) = child_input(&self.io) {
                interest.push((Source::ChildIn, fd, PollFlags::POLLOUT));
            }
        }
        if self.child_out_open && self.to_stdout.is_empty() {
            interest.push((Source::ChildOut, child_output(&self.io), PollFlags::POLLIN));
        }
        if !self.to_stdout.is_empty() {
            interest.push((Source::HostOut, host_stdout(), PollFlags::POLLOUT));
        }
        if self.child_err_open && self.to_stderr.is_empty() {
            if let Some(fd) = child_error(&self.io) {
                interest.push((Source::ChildErr, fd, PollFlags::POLLIN));
            }
        }
        if !self.to_stderr.is_empty() {
            interest.push((Source::HostErr, host_stderr(), PollFlags::POLLOUT));
        }
        if let Some(net) = &self.network {
            if let Some(fd) = net.socket() {
                interest.push((Source::Dhcp, fd, PollFlags::POLLIN));
            }
            interest.push((Source::Timer, net.timer(), PollFlags::POLLIN));
        }
        interest
    }

    fn wait_ready(&self) -> Result<Vec<Source>> {
        let interest = self.interest();
        let mut fds: Vec<PollFd<'_>> = interest
            .iter()
            .map(|(_, fd, events)| PollFd::new(*fd, *events))
            .collect();
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Vec::new()),
            Err(e) => return Err(BurrowError::syscall("poll", e)),
        }
        Ok(interest
            .iter()
            .zip(&fds)
            .filter(|(_, fd)| fd.revents().is_some_and(|r| !r.is_empty()))
            .map(|((source, _, _), _)| *source)
            .collect())
    }

    fn dispatch(&mut self, source: Source) -> Result<Option<ExitDisposition>> {
        match source {
            Source::Signals => return self.on_signals(),
            Source::HostIn => self.on_host_input()?,
            Source::ChildIn => self.flush_to_child()?,
            Source::ChildOut => {
                let mut src = FdStream(child_output(&self.io));
                if transfer("read(child stdout)", self.to_stdout.fill_from(&mut src))?
                    == Transfer::Closed
                {
                    self.child_out_open = false;
                }
            }
            Source::ChildErr => {
                if let Some(fd) = child_error(&self.io) {
                    let result = self.to_stderr.fill_from(&mut FdStream(fd));
                    if transfer("read(child stderr)", result)? == Transfer::Closed {
                        self.child_err_open = false;
                    }
                }
            }
            Source::HostOut => {
                let result = self.to_stdout.flush_into(&mut FdStream(host_stdout()));
                if transfer("write(stdout)", result)? == Transfer::Closed {
                    self.to_stdout.clear();
                }
            }
            Source::HostErr => {
                let result = self.to_stderr.flush_into(&mut FdStream(host_stderr()));
                if transfer("write(stderr)", result)? == Transfer::Closed {
                    self.to_stderr.clear();
                }
            }
            Source::Dhcp => {
                if let Some(net) = self.network.as_mut() {
                    net.on_socket_readable()?;
                }
            }
            Source::Timer => {
                if let Some(net) = self.network.as_mut() {
                    net.on_timer()?;
                }
            }
        }
        Ok(None)
    }

    fn on_signals(&mut self) -> Result<Option<ExitDisposition>> {
        loop {
            let info = match self.signals.fd.read_signal() {
                Ok(Some(info)) => info,
                Ok(None) => return Ok(None),
                Err(e) => return Err(BurrowError::syscall("read(signalfd)", e)),
            };
            let Ok(sig) = i32::try_from(info.ssi_signo)
                .map_err(|_| Errno::EINVAL)
                .and_then(Signal::try_from)
            else {
                continue;
            };
            match (sig, &self.io) {
                (Signal::SIGCHLD, _) => {
                    if let Some(exit) = self.reap()? {
                        return Ok(Some(exit));
                    }
                }
                (Signal::SIGWINCH, ChildIo::Pty { master }) => {
                    if let Err(e) = terminal::propagate_window_size(master.as_fd()) {
                        tracing::warn!(error = %e, "could not resize the child terminal");
                    }
                }
                _ => {
                    tracing::debug!(signal = ?sig, pid = %self.pid, "forwarding signal");
                    if let Err(e) = signal::kill(self.pid, sig) {
                        tracing::warn!(signal = ?sig, error = %e, "could not forward signal");
                    }
                }
            }
        }
    }

    fn on_host_input(&mut self) -> Result<()> {
        let read = match self.to_child.fill_from(&mut FdStream(terminal::host_stdin())) {
            Err(e) if e.raw_os_error() == Some(libc::EBADF) => Ok(Transfer::Closed),
            other => other,
        };
        match transfer("read(stdin)", read)? {
            Transfer::Moved(_) => {
                if self.interrupt.feed(self.to_child.pending()) {
                    tracing::info!(pid = %self.pid, "interrupt sequence received, killing the child");
                    let _ = signal::kill(self.pid, Signal::SIGKILL);
                }
                self.flush_to_child()
            }
            Transfer::Closed => {
                self.host_in_open = false;
                // A pty master cannot be half-closed: dropping it would also
                // cut the child's output, so in pty mode input just stops.
                if let ChildIo::Pipes { stdin, .. } = &mut self.io {
                    *stdin = None;
                    self.child_in_open = false;
                }
                Ok(())
            }
            Transfer::Retry => Ok(()),
        }
    }

    fn flush_to_child(&mut self) -> Result<()> {
        let Some(fd) = child_input(&self.io).filter(|_| self.child_in_open) else {
            self.to_child.clear();
            return Ok(());
        };
        let result = self.to_child.flush_into(&mut FdStream(fd));
        if transfer("write(child stdin)", result)? == Transfer::Closed {
            self.to_child.clear();
            self.child_in_open = false;
            self.host_in_open = false;
            if let ChildIo::Pipes { stdin, .. } = &mut self.io {
                *stdin = None;
            }
        }
        Ok(())
    }

    fn reap(&self) -> Result<Option<ExitDisposition>> {
        let status = waitpid(self.pid, Some(WaitPidFlag::WNOHANG))
            .map_err(|e| BurrowError::syscall(format!("waitpid({})", self.pid), e))?;
        let exit = ExitDisposition::from_status(status);
        if let Some(exit) = exit {
            tracing::info!(pid = %self.pid, ?exit, "child terminated");
        }
        Ok(exit)
    }

    /// Copies whatever the child wrote before exiting to the host.
    fn finish(mut self, exit: ExitDisposition) -> ExitDisposition {
        if self.child_out_open || !self.to_stdout.is_empty() {
            drain(Some(child_output(&self.io)), &mut self.to_stdout, host_stdout());
        }
        if self.child_err_open || !self.to_stderr.is_empty() {
            drain(child_error(&self.io), &mut self.to_stderr, host_stderr());
        }
        exit
    }
}

fn child_input(io: &ChildIo) -> Option<BorrowedFd<'_>> {
    match io {
        ChildIo::Pty { master } => Some(master.as_fd()),
        ChildIo::Pipes { stdin, .. } => stdin.as_ref().map(AsFd::as_fd),
    }
}

fn child_output(io: &ChildIo) -> BorrowedFd<'_> {
    match io {
        ChildIo::Pty { master } => master.as_fd(),
        ChildIo::Pipes { stdout, .. } => stdout.as_fd(),
    }
}

fn child_error(io: &ChildIo) -> Option<BorrowedFd<'_>> {
    match io {
        ChildIo::Pty { .. } => None,
        ChildIo::Pipes { stderr, .. } => Some(stderr.as_fd()),
    }
}

fn host_stdout() -> BorrowedFd<'static> {
    // SAFETY: standard output stays open for the life of the process.
    unsafe { BorrowedFd::borrow_raw(libc::STDOUT_FILENO) }
}

fn host_stderr() -> BorrowedFd<'static> {
    // SAFETY: standard error stays open for the life of the process.
    unsafe { BorrowedFd::borrow_raw(libc::STDERR_FILENO) }
}

fn transfer(op: &str, result: std::io::Result<Transfer>) -> Result<Transfer> {
    result.map_err(|e| BurrowError::syscall(op, e))
}

/// Moves everything readable from `src` right now to `dst`, blocking on
/// `dst` if needed.
fn drain(src: Option<BorrowedFd<'_>>, relay: &mut Relay, dst: BorrowedFd<'_>) {
    let mut dst = FdStream(dst);
    loop {
        while !relay.is_empty() {
            match relay.flush_into(&mut dst) {
                Ok(Transfer::Moved(_) | Transfer::Retry) => {}
                Ok(Transfer::Closed) | Err(_) => {
                    relay.clear();
                    return;
                }
            }
        }
        let Some(fd) = src else {
            return;
        };
        if !matches!(relay.fill_from(&mut FdStream(fd)), Ok(Transfer::Moved(_))) {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn drain_copies_everything_buffered_in_a_pipe() {
        let (child_reader, mut child_writer) = {
            let (r, w) = nix::unistd::pipe().expect("pipe");
            (r, std::fs::File::from(w))
        };
        crate::process::set_nonblocking(&child_reader).expect("nonblocking");
        let payload: Vec<u8> = b"line\n".repeat(600);
        child_writer.write_all(&payload).expect("write");
        drop(child_writer);

        let (host_reader, host_writer) = nix::unistd::pipe().expect("pipe");
        let reader = std::thread::spawn(move || {
            let mut out = Vec::new();
            std::io::Read::read_to_end(&mut std::fs::File::from(host_reader), &mut out)
                .expect("read");
            out
        });

        let mut relay = Relay::default();
        drain(Some(child_reader.as_fd()), &mut relay, host_writer.as_fd());
        drop(host_writer);
        assert_eq!(reader.join().expect("join"), payload);
    }

    #[test]
    fn pipes_expose_three_streams_pty_one() {
        let (r, w) = nix::unistd::pipe().expect("pipe");
        let (r2, _w2) = nix::unistd::pipe().expect("pipe");
        let io = ChildIo::Pipes {
            stdin: Some(w),
            stdout: r,
            stderr: r2,
        };
        assert!(child_input(&io).is_some());
        assert!(child_error(&io).is_some());

        let pty = nix::pty::openpty(None, None).expect("openpty");
        let io = ChildIo::Pty { master: pty.master };
        assert!(child_error(&io).is_none());
        assert_eq!(
            std::os::fd::AsRawFd::as_raw_fd(&child_input(&io).expect("master")),
            std::os::fd::AsRawFd::as_raw_fd(&child_output(&io))
        );
    }
}
