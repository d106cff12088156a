//! Minimal rtnetlink client.
//!
//! Covers the handful of requests the runtime needs: link lookup, macvlan
//! creation and deletion, bringing links up, IPv4 addresses and the default
//! route. Messages are assembled byte by byte in native endianness, which is
//! what the routing socket expects.

use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use burrow_common::error::{BurrowError, Result};
use burrow_common::types::MacAddr;

// Message types
const NLMSG_ERROR: u16 = 2;
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_GETLINK: u16 = 18;
const RTM_NEWADDR: u16 = 20;
const RTM_NEWROUTE: u16 = 24;

// Flags
const NLM_F_REQUEST: u16 = 0x0001;
const NLM_F_ACK: u16 = 0x0004;
const NLM_F_REPLACE: u16 = 0x0100;
const NLM_F_EXCL: u16 = 0x0200;
const NLM_F_CREATE: u16 = 0x0400;
const NLA_F_NESTED: u16 = 1 << 15;
const NLA_TYPE_MASK: u16 = 0x3fff;

const IFF_UP: u32 = 0x1;

// Link attributes
const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_LINK: u16 = 5;
const IFLA_LINKINFO: u16 = 18;
const IFLA_NET_NS_PID: u16 = 19;
const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;
const IFLA_MACVLAN_MODE: u16 = 1;
const MACVLAN_MODE_BRIDGE: u32 = 4;

// Address attributes
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_BROADCAST: u16 = 4;

// Route attributes and constants
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;
const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RT_SCOPE_UNIVERSE: u8 = 0;
const RTN_UNICAST: u8 = 1;

const NLMSG_HDRLEN: usize = 16;
const IFINFOMSG_LEN: usize = 16;
const RECV_BUFFER: usize = 32 * 1024;

/// Rounds `len` up to the 4-byte netlink alignment.
const fn align(len: usize) -> usize {
    (len + 3) & !3
}

/// What the kernel reports about a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    /// Interface index.
    pub index: u32,
    /// Hardware address, when the link has one.
    pub mac: Option<MacAddr>,
}

/// Incremental builder for one netlink request.
#[derive(Debug)]
struct MessageBuilder {
    buf: Vec<u8>,
    nests: Vec<usize>,
}

impl MessageBuilder {
    fn new(kind: u16, flags: u16, seq: u32) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // patched in finish()
        buf.extend_from_slice(&kind.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes());
        Self {
            buf,
            nests: Vec::new(),
        }
    }

    /// Appends the family-specific fixed header.
    fn header(mut self, bytes: &[u8]) -> Self {
        self.buf.extend_from_slice(bytes);
        self.pad();
        self
    }

    fn attr(&mut self, kind: u16, payload: &[u8]) -> &mut Self {
        let len = u16::try_from(4 + payload.len()).unwrap_or(u16::MAX);
        self.buf.extend_from_slice(&len.to_ne_bytes());
        self.buf.extend_from_slice(&kind.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.pad();
        self
    }

    fn attr_u32(&mut self, kind: u16, value: u32) -> &mut Self {
        self.attr(kind, &value.to_ne_bytes())
    }

    fn attr_str(&mut self, kind: u16, value: &str) -> &mut Self {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.attr(kind, &payload)
    }

    fn begin_nested(&mut self, kind: u16) -> &mut Self {
        self.nests.push(self.buf.len());
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(kind | NLA_F_NESTED).to_ne_bytes());
        self
    }

    fn end_nested(&mut self) -> &mut Self {
        if let Some(start) = self.nests.pop() {
            let len = u16::try_from(self.buf.len() - start).unwrap_or(u16::MAX);
            self.buf[start..start + 2].copy_from_slice(&len.to_ne_bytes());
        }
        self
    }

    fn pad(&mut self) {
        self.buf.resize(align(self.buf.len()), 0);
    }

    fn finish(&mut self) -> Vec<u8> {
        let len = u32::try_from(self.buf.len()).unwrap_or(u32::MAX);
        self.buf[..4].copy_from_slice(&len.to_ne_bytes());
        mem::take(&mut self.buf)
    }
}

fn ifinfomsg(index: u32, flags: u32, change: u32) -> [u8; IFINFOMSG_LEN] {
    let mut out = [0u8; IFINFOMSG_LEN];
    // family AF_UNSPEC, pad, type: all zero
    out[4..8].copy_from_slice(&index.to_ne_bytes());
    out[8..12].copy_from_slice(&flags.to_ne_bytes());
    out[12..16].copy_from_slice(&change.to_ne_bytes());
    out
}

fn ifaddrmsg(prefix_len: u8, index: u32) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[0] = inet_family();
    out[1] = prefix_len;
    out[3] = RT_SCOPE_UNIVERSE;
    out[4..8].copy_from_slice(&index.to_ne_bytes());
    out
}

fn rtmsg_default_route() -> [u8; 12] {
    [
        inet_family(),
        0, // dst_len: default route
        0,
        0,
        RT_TABLE_MAIN,
        RTPROT_BOOT,
        RT_SCOPE_UNIVERSE,
        RTN_UNICAST,
        0,
        0,
        0,
        0,
    ]
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn inet_family() -> u8 {
    libc::AF_INET as u8
}

/// One message out of a netlink datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reply<'a> {
    kind: u16,
    seq: u32,
    body: &'a [u8],
}

/// Splits a datagram into its messages, stopping at the first truncated one.
fn split_replies(datagram: &[u8]) -> Vec<Reply<'_>> {
    let mut replies = Vec::new();
    let mut offset = 0;
    while datagram.len() >= offset + NLMSG_HDRLEN {
        let len = read_u32(datagram, offset) as usize;
        if len < NLMSG_HDRLEN || offset + len > datagram.len() {
            break;
        }
        replies.push(Reply {
            kind: read_u16(datagram, offset + 4),
            seq: read_u32(datagram, offset + 8),
            body: &datagram[offset + NLMSG_HDRLEN..offset + len],
        });
        offset += align(len);
    }
    replies
}

/// Iterates over the `(type, payload)` attributes in `data`.
fn attributes(data: &[u8]) -> Vec<(u16, &[u8])> {
    let mut attrs = Vec::new();
    let mut offset = 0;
    while data.len() >= offset + 4 {
        let len = usize::from(read_u16(data, offset));
        if len < 4 || offset + len > data.len() {
            break;
        }
        let kind = read_u16(data, offset + 2) & NLA_TYPE_MASK;
        attrs.push((kind, &data[offset + 4..offset + len]));
        offset += align(len);
    }
    attrs
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_ne_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_ne_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Decodes an `RTM_NEWLINK` body into [`LinkInfo`].
fn parse_link(body: &[u8]) -> Option<LinkInfo> {
    if body.len() < IFINFOMSG_LEN {
        return None;
    }
    let index = read_u32(body, 4);
    let mac = attributes(&body[IFINFOMSG_LEN..])
        .into_iter()
        .find(|(kind, _)| *kind == IFLA_ADDRESS)
        .and_then(|(_, payload)| <[u8; 6]>::try_from(payload).ok())
        .map(MacAddr);
    Some(LinkInfo { index, mac })
}

/// Decodes the errno carried by an `NLMSG_ERROR` body; zero is an ack.
fn parse_error(body: &[u8]) -> Option<i32> {
    (body.len() >= 4).then(|| i32::from_ne_bytes([body[0], body[1], body[2], body[3]]))
}

/// A routing socket bound to the current network namespace.
#[derive(Debug)]
pub struct NetlinkHandle {
    fd: OwnedFd,
    seq: u32,
}

impl NetlinkHandle {
    /// Opens a `NETLINK_ROUTE` socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound.
    pub fn new() -> Result<Self> {
        // SAFETY: plain socket(2) call; the result is checked below.
        let raw = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if raw < 0 {
            return Err(BurrowError::last_os_error("socket(AF_NETLINK)"));
        }
        // SAFETY: raw is a freshly created descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = netlink_family();
        // SAFETY: addr lives for the duration of the call and the length
        // matches its type.
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                std::ptr::from_ref(&addr).cast::<libc::sockaddr>(),
                socklen_of::<libc::sockaddr_nl>(),
            )
        };
        if ret < 0 {
            return Err(BurrowError::last_os_error("bind(AF_NETLINK)"));
        }
        Ok(Self { fd, seq: 0 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Sends `msg` and waits for the answer carrying sequence `seq`: either
    /// an acknowledgement (`Ok(None)`), a data reply (`Ok(Some(body))`) or
    /// an error from the kernel.
    fn transact(&self, what: &str, seq: u32, msg: &[u8]) -> Result<Option<Vec<u8>>> {
        // SAFETY: msg is a valid buffer of msg.len() bytes.
        let sent = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr().cast::<libc::c_void>(),
                msg.len(),
                0,
            )
        };
        if sent < 0 {
            return Err(BurrowError::last_os_error(format!("netlink send ({what})")));
        }

        let mut buf = vec![0u8; RECV_BUFFER];
        loop {
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
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(BurrowError::syscall(format!("netlink recv ({what})"), err));
            }
            let n = usize::try_from(n).unwrap_or(0);

            let Some(reply) = split_replies(&buf[..n]).into_iter().find(|r| r.seq == seq) else {
                continue;
            };
            if reply.kind != NLMSG_ERROR {
                return Ok(Some(reply.body.to_vec()));
            }
            return match parse_error(reply.body) {
                Some(0) => Ok(None),
                Some(code) => Err(BurrowError::Netlink {
                    message: format!("{what}: {}", io::Error::from_raw_os_error(-code)),
                }),
                None => Err(BurrowError::Netlink {
                    message: format!("{what}: truncated error reply"),
                }),
            };
        }
    }

    /// Looks a link up by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the link does not exist or the reply is malformed.
    pub fn link_info(&mut self, name: &str) -> Result<LinkInfo> {
        let seq = self.next_seq();
        let msg = MessageBuilder::new(RTM_GETLINK, NLM_F_REQUEST, seq)
            .header(&ifinfomsg(0, 0, 0))
            .attr_str(IFLA_IFNAME, name)
            .finish();

        let body = self
            .transact(&format!("get link {name}"), seq, &msg)?
            .ok_or_else(|| BurrowError::NotFound {
                kind: "network interface",
                id: name.to_string(),
            })?;
        parse_link(&body).ok_or_else(|| BurrowError::Netlink {
            message: format!("malformed link reply for {name}"),
        })
    }

    /// Creates a bridge-mode macvlan called `name` on top of `parent`,
    /// placed directly into the network namespace of `target_pid` and
    /// brought up.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the request.
    pub fn create_macvlan(
        &mut self,
        parent: u32,
        name: &str,
        target_pid: i32,
        mac: Option<MacAddr>,
    ) -> Result<()> {
        let seq = self.next_seq();
        let mut builder = MessageBuilder::new(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
        )
        .header(&ifinfomsg(0, IFF_UP, IFF_UP));
        let _ = builder
            .attr_str(IFLA_IFNAME, name)
            .attr_u32(IFLA_LINK, parent)
            .attr_u32(IFLA_NET_NS_PID, target_pid.unsigned_abs());
        if let Some(mac) = mac.filter(|m| !m.is_unspecified()) {
            let _ = builder.attr(IFLA_ADDRESS, &mac.octets());
        }
        let msg = builder
            .begin_nested(IFLA_LINKINFO)
            .attr_str(IFLA_INFO_KIND, "macvlan")
            .begin_nested(IFLA_INFO_DATA)
            .attr_u32(IFLA_MACVLAN_MODE, MACVLAN_MODE_BRIDGE)
            .end_nested()
            .end_nested()
            .finish();

        let _ = self.transact(&format!("create macvlan {name}"), seq, &msg)?;
        Ok(())
    }

    /// Deletes the link with the given index.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the request.
    pub fn delete_link(&mut self, index: u32) -> Result<()> {
        let seq = self.next_seq();
        let msg = MessageBuilder::new(RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK, seq)
            .header(&ifinfomsg(index, 0, 0))
            .finish();
        let _ = self.transact(&format!("delete link {index}"), seq, &msg)?;
        Ok(())
    }

    /// Brings the link with the given index up.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the request.
    pub fn set_up(&mut self, index: u32) -> Result<()> {
        let seq = self.next_seq();
        let msg = MessageBuilder::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq)
            .header(&ifinfomsg(index, IFF_UP, IFF_UP))
            .finish();
        let _ = self.transact(&format!("set link {index} up"), seq, &msg)?;
        Ok(())
    }

    /// Assigns `address/prefix_len` with the given broadcast address,
    /// replacing an identical assignment left by a previous lease.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the request.
    pub fn add_address(
        &mut self,
        index: u32,
        address: Ipv4Addr,
        prefix_len: u8,
        broadcast: Ipv4Addr,
    ) -> Result<()> {
        let seq = self.next_seq();
        let msg = MessageBuilder::new(
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
            seq,
        )
        .header(&ifaddrmsg(prefix_len, index))
        .attr(IFA_LOCAL, &address.octets())
        .attr(IFA_ADDRESS, &address.octets())
        .attr(IFA_BROADCAST, &broadcast.octets())
        .finish();
        let _ = self.transact(&format!("add address {address}/{prefix_len}"), seq, &msg)?;
        Ok(())
    }

    /// Installs (or replaces) the default route through `gateway` on the
    /// link with the given index.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the request.
    pub fn replace_default_route(&mut self, index: u32, gateway: Ipv4Addr) -> Result<()> {
        let seq = self.next_seq();
        let msg = MessageBuilder::new(
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
            seq,
        )
        .header(&rtmsg_default_route())
        .attr(RTA_GATEWAY, &gateway.octets())
        .attr_u32(RTA_OIF, index)
        .finish();
        let _ = self.transact(&format!("default route via {gateway}"), seq, &msg)?;
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
const fn netlink_family() -> libc::sa_family_t {
    libc::AF_NETLINK as libc::sa_family_t
}

/// Size of a socket address type as a `socklen_t`.
#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn socklen_of<T>() -> libc::socklen_t {
    mem::size_of::<T>() as libc::socklen_t
}

/// Converts a dotted netmask into a prefix length.
#[must_use]
pub fn prefix_len(mask: Ipv4Addr) -> u8 {
    u8::try_from(u32::from(mask).count_ones()).unwrap_or(32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_carries_length_type_and_seq() {
        let msg = MessageBuilder::new(RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK, 7)
            .header(&ifinfomsg(3, 0, 0))
            .finish();
        assert_eq!(msg.len(), NLMSG_HDRLEN + IFINFOMSG_LEN);
        assert_eq!(read_u32(&msg, 0) as usize, msg.len());
        assert_eq!(read_u16(&msg, 4), RTM_DELLINK);
        assert_eq!(read_u16(&msg, 6), NLM_F_REQUEST | NLM_F_ACK);
        assert_eq!(read_u32(&msg, 8), 7);
        assert_eq!(read_u32(&msg, NLMSG_HDRLEN + 4), 3);
    }

    #[test]
    fn attributes_are_padded_to_four_bytes() {
        let msg = MessageBuilder::new(RTM_GETLINK, NLM_F_REQUEST, 1)
            .header(&ifinfomsg(0, 0, 0))
            .attr_str(IFLA_IFNAME, "eth0")
            .finish();
        // 4 header + "eth0\0" = 9, padded to 12
        assert_eq!(msg.len(), NLMSG_HDRLEN + IFINFOMSG_LEN + 12);
        let attrs = attributes(&msg[NLMSG_HDRLEN + IFINFOMSG_LEN..]);
        assert_eq!(attrs, vec![(IFLA_IFNAME, &b"eth0\0"[..])]);
    }

    #[test]
    fn nested_attributes_wrap_their_children() {
        let mut builder = MessageBuilder::new(RTM_NEWLINK, NLM_F_REQUEST, 1)
            .header(&ifinfomsg(0, 0, 0));
        let msg = builder
            .begin_nested(IFLA_LINKINFO)
            .attr_str(IFLA_INFO_KIND, "macvlan")
            .begin_nested(IFLA_INFO_DATA)
            .attr_u32(IFLA_MACVLAN_MODE, MACVLAN_MODE_BRIDGE)
            .end_nested()
            .end_nested()
            .finish();

        let outer = attributes(&msg[NLMSG_HDRLEN + IFINFOMSG_LEN..]);
        assert_eq!(outer.len(), 1);
        assert_eq!(outer[0].0, IFLA_LINKINFO);
        let raw_type = read_u16(&msg, NLMSG_HDRLEN + IFINFOMSG_LEN + 2);
        assert_ne!(raw_type & NLA_F_NESTED, 0);

        let inner = attributes(outer[0].1);
        assert_eq!(inner[0], (IFLA_INFO_KIND, &b"macvlan\0"[..]));
        assert_eq!(inner[1].0, IFLA_INFO_DATA);
        let data = attributes(inner[1].1);
        assert_eq!(data, vec![(IFLA_MACVLAN_MODE, &MACVLAN_MODE_BRIDGE.to_ne_bytes()[..])]);
    }

    #[test]
    fn link_reply_yields_index_and_mac() {
        let mac = [0x02, 0x42, 0xac, 0x11, 0x00, 0x02];
        let mut builder = MessageBuilder::new(RTM_NEWLINK, 0, 5).header(&ifinfomsg(9, IFF_UP, 0));
        let msg = builder.attr_str(IFLA_IFNAME, "eth0").attr(IFLA_ADDRESS, &mac).finish();

        let replies = split_replies(&msg);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].seq, 5);
        let info = parse_link(replies[0].body).expect("link");
        assert_eq!(info.index, 9);
        assert_eq!(info.mac, Some(MacAddr(mac)));
    }

    #[test]
    fn error_reply_carries_negative_errno() {
        let mut msg = MessageBuilder::new(NLMSG_ERROR, 0, 3)
            .header(&(-libc::EEXIST).to_ne_bytes())
            .finish();
        let replies = split_replies(&msg);
        assert_eq!(replies[0].kind, NLMSG_ERROR);
        assert_eq!(parse_error(replies[0].body), Some(-libc::EEXIST));

        msg.truncate(NLMSG_HDRLEN - 1);
        assert!(split_replies(&msg).is_empty());
    }

    #[test]
    fn several_messages_in_one_datagram() {
        let mut datagram = MessageBuilder::new(RTM_NEWLINK, 0, 1)
            .header(&ifinfomsg(1, 0, 0))
            .finish();
        datagram.extend(
            MessageBuilder::new(NLMSG_ERROR, 0, 2)
                .header(&0i32.to_ne_bytes())
                .finish(),
        );
        let seqs: Vec<u32> = split_replies(&datagram).iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn default_route_message_targets_main_table() {
        let rt = rtmsg_default_route();
        assert_eq!(rt[1], 0);
        assert_eq!(rt[4], RT_TABLE_MAIN);
        assert_eq!(rt[7], RTN_UNICAST);
    }

    #[test]
    fn netmask_to_prefix() {
        assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 255, 0)), 24);
        assert_eq!(prefix_len(Ipv4Addr::new(255, 255, 240, 0)), 20);
        assert_eq!(prefix_len(Ipv4Addr::UNSPECIFIED), 0);
    }
}
