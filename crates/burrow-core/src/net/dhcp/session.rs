//! A DHCP exchange bound to a live interface.

use std::net::Ipv4Addr;
use std::os::fd::{AsFd, BorrowedFd};
use std::path::PathBuf;

use burrow_common::constants::RESOLV_CONF;
use burrow_common::error::{BurrowError, Result};

use super::socket::PacketSocket;
use super::{DhcpClient, Lease, Step};
use crate::net::netlink::{NetlinkHandle, prefix_len};
use crate::net::resolv;

/// Drives a [`DhcpClient`] over a packet socket and applies the lease it
/// obtains: address, default route and resolver configuration.
///
/// The socket only exists while an exchange is in flight; it is closed once
/// the lease is bound and reopened by [`DhcpSession::restart`].
#[derive(Debug)]
pub struct DhcpSession {
    socket: Option<PacketSocket>,
    client: DhcpClient,
    ifindex: u32,
    dns_override: Option<Ipv4Addr>,
    resolv_conf: PathBuf,
}

impl DhcpSession {
    /// Opens a socket on `ifname` and broadcasts the first DISCOVER.
    ///
    /// `hostname` is announced to the server; `dns_override` replaces the
    /// offered name servers in the resolver configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the interface has no hardware address or the
    /// socket cannot be set up.
    pub fn start(
        ifname: &str,
        hostname: Option<String>,
        dns_override: Option<Ipv4Addr>,
    ) -> Result<Self> {
        let link = NetlinkHandle::new()?.link_info(ifname)?;
        let mac = link.mac.ok_or_else(|| BurrowError::Config {
            message: format!("{ifname} has no hardware address"),
        })?;
        let mut session = Self {
            socket: None,
            client: DhcpClient::new(mac, hostname),
            ifindex: link.index,
            dns_override,
            resolv_conf: PathBuf::from(RESOLV_CONF),
        };
        session.restart()?;
        Ok(session)
    }

    /// Throws the current socket away and starts over from discovery on a
    /// fresh one, keeping the transaction id.
    ///
    /// # Errors
    ///
    /// Returns an error if a new socket cannot be opened or the DISCOVER
    /// cannot be sent.
    pub fn restart(&mut self) -> Result<()> {
        self.socket = None;
        let socket = PacketSocket::open(self.ifindex)?;
        socket.broadcast(&self.client.discover())?;
        self.socket = Some(socket);
        Ok(())
    }

    /// The socket to poll for readability, while an exchange is in flight.
    #[must_use]
    pub fn socket(&self) -> Option<BorrowedFd<'_>> {
        self.socket.as_ref().map(AsFd::as_fd)
    }

    /// Handles one readable event on the socket. Returns the lease once it
    /// has been bound and applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket fails or the lease cannot be applied.
    pub fn on_readable(&mut self) -> Result<Option<Lease>> {
        let Some(socket) = &self.socket else {
            return Ok(None);
        };
        let Some(frame) = socket.recv()? else {
            return Ok(None);
        };
        match self.client.handle(&frame) {
            Step::Ignore => Ok(None),
            Step::Send(reply) => {
                socket.broadcast(&reply)?;
                Ok(None)
            }
            Step::Bound(lease) => {
                self.socket = None;
                self.apply(&lease)?;
                Ok(Some(lease))
            }
        }
    }

    fn apply(&self, lease: &Lease) -> Result<()> {
        let mut nl = NetlinkHandle::new()?;
        nl.add_address(
            self.ifindex,
            lease.address,
            prefix_len(lease.netmask),
            lease.broadcast,
        )?;
        if let Some(router) = lease.router {
            nl.replace_default_route(self.ifindex, router)?;
        }
        let conf = resolv::render(&lease.dns, lease.domain.as_deref(), self.dns_override);
        std::fs::write(&self.resolv_conf, conf)
            .map_err(|e| BurrowError::io(&self.resolv_conf, e))?;
        tracing::info!(
            address = %lease.address,
            prefix = prefix_len(lease.netmask),
            router = ?lease.router,
            "network configured"
        );
        Ok(())
    }

    /// The state machine, for inspection.
    #[must_use]
    pub const fn client(&self) -> &DhcpClient {
        &self.client
    }
}
