//! DHCP and lease renewal inside the supervision loop.

use std::net::Ipv4Addr;
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use burrow_common::constants::{DHCP_RETRY_SECS, MACVLAN_NAME};
use burrow_common::error::{BurrowError, Result};
use burrow_core::net::dhcp::session::DhcpSession;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};

use crate::process::GateOpener;

/// Network state owned by the supervisor of a container with its own
/// network namespace: the DHCP session, the renewal timer and the gate the
/// child waits on until the first lease is bound.
#[derive(Debug)]
pub struct Network {
    session: Option<DhcpSession>,
    timer: TimerFd,
    hostname: Option<String>,
    dns: Option<Ipv4Addr>,
    gate: GateOpener,
}

impl Network {
    /// Starts the first DHCP exchange on the container's macvlan.
    ///
    /// A failing first attempt is retried when the timer fires.
    ///
    /// # Errors
    ///
    /// Returns an error only if the timer cannot be created or armed.
    pub fn start(hostname: Option<String>, dns: Option<Ipv4Addr>, gate: GateOpener) -> Result<Self> {
        let timer = TimerFd::new(
            ClockId::CLOCK_MONOTONIC,
            TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
        )
        .map_err(|e| BurrowError::syscall("timerfd_create", e))?;
        let mut network = Self {
            session: None,
            timer,
            hostname,
            dns,
            gate,
        };
        network.begin_exchange();
        network.arm(retry_delay())?;
        Ok(network)
    }

    /// The DHCP socket, while an exchange is in flight.
    pub fn socket(&self) -> Option<BorrowedFd<'_>> {
        self.session.as_ref().and_then(DhcpSession::socket)
    }

    /// The renewal timer.
    pub fn timer(&self) -> BorrowedFd<'_> {
        self.timer.as_fd()
    }

    /// Handles DHCP socket readiness. Bad packets and configuration
    /// failures are only logged.
    ///
    /// # Errors
    ///
    /// Returns an error if the renewal timer cannot be armed.
    pub fn on_socket_readable(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        match session.on_readable() {
            Ok(Some(lease)) => {
                let renew = lease.renewal_after();
                tracing::debug!(renew_secs = renew.as_secs(), "lease renewal scheduled");
                self.arm(renew)?;
                if self.gate.is_closed() {
                    self.gate.open();
                }
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "dhcp exchange failed"),
        }
        Ok(())
    }

    /// Handles timer expiry: renewal or retry both start over from
    /// discovery.
    ///
    /// # Errors
    ///
    /// Returns an error if the timer cannot be read or rearmed.
    pub fn on_timer(&mut self) -> Result<()> {
        match self.timer.wait() {
            Ok(()) => {}
            Err(nix::errno::Errno::EAGAIN) => return Ok(()),
            Err(e) => return Err(BurrowError::syscall("read(timerfd)", e)),
        }
        tracing::debug!("dhcp timer expired, starting over");
        self.begin_exchange();
        self.arm(retry_delay())
    }

    fn begin_exchange(&mut self) {
        let result = if let Some(session) = self.session.as_mut() {
            session.restart()
        } else {
            DhcpSession::start(MACVLAN_NAME, self.hostname.clone(), self.dns)
                .map(|session| self.session = Some(session))
        };
        if let Err(e) = result {
            tracing::warn!(error = %e, "could not start dhcp, retrying in {DHCP_RETRY_SECS}s");
        }
    }

    fn arm(&self, after: Duration) -> Result<()> {
        self.timer
            .set(
                Expiration::OneShot(TimeSpec::from_duration(after)),
                TimerSetTimeFlags::empty(),
            )
            .map_err(|e| BurrowError::syscall("timerfd_settime", e))
    }
}

const fn retry_delay() -> Duration {
    Duration::from_secs(DHCP_RETRY_SECS)
}
