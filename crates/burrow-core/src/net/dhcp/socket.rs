//! Link-layer socket carrying DHCP before the interface has an address.

use std::io;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use burrow_common::error::{BurrowError, Result};

use crate::net::netlink::socklen_of;

/// Largest IPv4 datagram.
const MAX_FRAME: usize = 65535;

/// `AF_PACKET`/`SOCK_DGRAM` socket bound to one interface, receiving IPv4
/// frames without their Ethernet header. Non-blocking: it is only read
/// after the event loop reports it readable.
#[derive(Debug)]
pub struct PacketSocket {
    fd: OwnedFd,
    ifindex: u32,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn eth_p_ip_be() -> u16 {
    (libc::ETH_P_IP as u16).to_be()
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn packet_family() -> u16 {
    libc::AF_PACKET as u16
}

fn link_address(ifindex: u32) -> libc::sockaddr_ll {
    // SAFETY: sockaddr_ll is plain old data; all-zero is a valid value.
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    addr.sll_family = packet_family();
    addr.sll_protocol = eth_p_ip_be();
    addr.sll_ifindex = i32::try_from(ifindex).unwrap_or(i32::MAX);
    addr
}

impl PacketSocket {
    /// Opens the socket and binds it to the interface with index `ifindex`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn open(ifindex: u32) -> Result<Self> {
        // SAFETY: plain socket(2) call; the result is checked below.
        let raw = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
                i32::from(eth_p_ip_be()),
            )
        };
        if raw < 0 {
            return Err(BurrowError::last_os_error("socket(AF_PACKET)"));
        }
        // SAFETY: raw is a freshly created descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let addr = link_address(ifindex);
        // SAFETY: addr lives for the duration of the call and the length
        // matches its type.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
                socklen_of::<libc::sockaddr_ll>(),
            )
        };
        if ret < 0 {
            return Err(BurrowError::last_os_error(format!("bind(AF_PACKET, {ifindex})")));
        }
        Ok(Self { fd, ifindex })
    }

    /// Broadcasts one frame on the link.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the frame.
    pub fn broadcast(&self, frame: &[u8]) -> Result<()> {
        let mut addr = link_address(self.ifindex);
        addr.sll_halen = 6;
        addr.sll_addr[..6].fill(0xff);
        // SAFETY: frame and addr are valid for the duration of the call.
        let ret = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr().cast::<libc::c_void>(),
                frame.len(),
                0,
                std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
                socklen_of::<libc::sockaddr_ll>(),
            )
        };
        if ret < 0 {
            return Err(BurrowError::last_os_error("sendto(AF_PACKET)"));
        }
        Ok(())
    }

    /// Receives one frame, or `None` when nothing is queued.
    ///
    /// # Errors
    ///
    /// Returns an error if `recv(2)` fails for another reason.
    pub fn recv(&self) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; MAX_FRAME];
        // SAFETY: buf is a valid writable buffer of buf.len() bytes.
        let n = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr().cast::<libc::c_void>(),
                buf.len(),
                0,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(BurrowError::syscall("recv(AF_PACKET)", err)),
            };
        }
        buf.truncate(usize::try_from(n).unwrap_or(0));
        Ok(Some(buf))
    }
}

impl AsFd for PacketSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}
