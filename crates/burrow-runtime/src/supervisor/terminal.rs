//! Host terminal handling for interactive containers.

use std::io::IsTerminal;
use std::os::fd::{AsRawFd, BorrowedFd};

use burrow_common::error::{BurrowError, Result};
use nix::pty::Winsize;
use nix::sys::termios::{self, SetArg, Termios};

use crate::process::TerminalSetup;

/// Captures the host terminal when both standard input and standard output
/// are terminals; `None` means the child gets pipes.
///
/// # Errors
///
/// Returns an error if the terminal attributes or size cannot be read.
pub fn capture() -> Result<Option<TerminalSetup>> {
    if !(std::io::stdin().is_terminal() && std::io::stdout().is_terminal()) {
        return Ok(None);
    }
    let termios =
        termios::tcgetattr(std::io::stdin()).map_err(|e| BurrowError::syscall("tcgetattr", e))?;
    let winsize = window_size(host_stdin())?;
    Ok(Some(TerminalSetup { termios, winsize }))
}

/// Reads the window size of the terminal behind `fd`.
///
/// # Errors
///
/// Returns an error if the `TIOCGWINSZ` ioctl fails.
pub fn window_size(fd: BorrowedFd<'_>) -> Result<Winsize> {
    let mut ws = Winsize {
        ws_row: 0,
        ws_col: 0,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: ws is a valid, writable winsize for the ioctl to fill.
    if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, &raw mut ws) } < 0 {
        return Err(BurrowError::last_os_error("ioctl(TIOCGWINSZ)"));
    }
    Ok(ws)
}

/// Applies `ws` to the terminal behind `fd`; the kernel then signals the
/// terminal's foreground process group.
///
/// # Errors
///
/// Returns an error if the `TIOCSWINSZ` ioctl fails.
pub fn set_window_size(fd: BorrowedFd<'_>, ws: &Winsize) -> Result<()> {
    // SAFETY: ws points to a valid winsize for the duration of the call.
    if unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::from_ref(ws)) } < 0 {
        return Err(BurrowError::last_os_error("ioctl(TIOCSWINSZ)"));
    }
    Ok(())
}

/// Copies the host's current window size onto the child's terminal.
///
/// # Errors
///
/// Returns an error if either ioctl fails.
pub fn propagate_window_size(master: BorrowedFd<'_>) -> Result<()> {
    let ws = window_size(host_stdin())?;
    set_window_size(master, &ws)?;
    tracing::debug!(rows = ws.ws_row, cols = ws.ws_col, "window resized");
    Ok(())
}

/// The host's standard input.
pub(crate) fn host_stdin() -> BorrowedFd<'static> {
    // SAFETY: standard input stays open for the life of the process.
    unsafe { BorrowedFd::borrow_raw(libc::STDIN_FILENO) }
}

/// Keeps the host terminal in raw mode and restores the saved attributes
/// when dropped.
#[derive(Debug)]
pub struct RawModeGuard {
    saved: Termios,
}

impl RawModeGuard {
    /// Switches the host terminal to raw mode; `saved` is restored later.
    ///
    /// # Errors
    ///
    /// Returns an error if the attributes cannot be set.
    pub fn enter(saved: &Termios) -> Result<Self> {
        let mut raw = saved.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(host_stdin(), SetArg::TCSADRAIN, &raw)
            .map_err(|e| BurrowError::syscall("tcsetattr(raw)", e))?;
        Ok(Self {
            saved: saved.clone(),
        })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = termios::tcsetattr(host_stdin(), SetArg::TCSADRAIN, &self.saved) {
            tracing::warn!(error = %e, "could not restore the terminal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;
    use std::os::fd::AsFd;

    #[test]
    fn window_size_round_trips_through_a_pty() {
        let pty = openpty(None, None).expect("openpty");
        let ws = Winsize {
            ws_row: 40,
            ws_col: 132,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        set_window_size(pty.master.as_fd(), &ws).expect("set");
        let read = window_size(pty.slave.as_fd()).expect("get");
        assert_eq!((read.ws_row, read.ws_col), (40, 132));
    }
}
