//! DHCP client.
//!
//! [`DhcpClient`] is the pure state machine: it turns received frames into
//! frames to send and, eventually, a [`Lease`]. [`session::DhcpSession`]
//! binds it to a packet socket and applies the lease to the interface.

pub mod packet;
pub mod session;
pub mod socket;

use std::net::Ipv4Addr;
use std::num::NonZeroU32;
use std::time::Duration;

use burrow_common::types::MacAddr;
use rand::Rng;

use self::packet::{DhcpOption, Header, MessageType, Op, Packet, decode_frame, encode_frame, tag};

/// Options asked for in every REQUEST.
pub const REQUESTED_PARAMETERS: [u8; 4] = [
    tag::SUBNET_MASK,
    tag::ROUTER,
    tag::DOMAIN_NAME_SERVER,
    tag::DOMAIN_NAME,
];

/// A bound address and the network configuration that came with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Assigned address.
    pub address: Ipv4Addr,
    /// Subnet mask.
    pub netmask: Ipv4Addr,
    /// Broadcast address; derived from address and mask when not offered.
    pub broadcast: Ipv4Addr,
    /// Default gateway.
    pub router: Option<Ipv4Addr>,
    /// DNS servers, in preference order.
    pub dns: Vec<Ipv4Addr>,
    /// Resolver search domain.
    pub domain: Option<String>,
    /// Lease duration in seconds.
    pub lease_secs: u32,
    /// Server that granted the lease.
    pub server: Ipv4Addr,
}

impl Lease {
    fn from_ack(packet: &Packet, offered: Ipv4Addr, server: Ipv4Addr) -> Option<Self> {
        let opts = &packet.options;
        let address = if packet.header.yiaddr.is_unspecified() {
            offered
        } else {
            packet.header.yiaddr
        };
        let netmask = opts.address(tag::SUBNET_MASK)?;
        let lease_secs = opts.u32(tag::LEASE_TIME)?;
        let broadcast = opts
            .address(tag::BROADCAST)
            .unwrap_or_else(|| Ipv4Addr::from(u32::from(address) | !u32::from(netmask)));
        Some(Self {
            address,
            netmask,
            broadcast,
            router: opts.address(tag::ROUTER),
            dns: opts.addresses(tag::DOMAIN_NAME_SERVER),
            domain: opts.text(tag::DOMAIN_NAME).filter(|d| !d.is_empty()),
            lease_secs,
            server,
        })
    }

    /// Delay after which the lease is renewed: 90% of its duration, and
    /// never less than a second.
    #[must_use]
    pub fn renewal_after(&self) -> Duration {
        Duration::from_secs((u64::from(self.lease_secs) * 9 / 10).max(1))
    }
}

/// Where the client stands in the exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    /// Nothing sent yet.
    Init,
    /// DISCOVER sent, waiting for an OFFER.
    Selecting,
    /// REQUEST sent for `offered`, waiting for the ACK from `server`.
    Requesting {
        /// Address being requested.
        offered: Ipv4Addr,
        /// Server that made the offer.
        server: Ipv4Addr,
    },
    /// Lease acquired.
    Bound(Lease),
}

/// What the caller has to do after feeding a frame to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Nothing; the frame was not for us or not expected now.
    Ignore,
    /// Broadcast this frame.
    Send(Vec<u8>),
    /// The lease is acquired and must be applied.
    Bound(Lease),
}

/// DHCP client state machine for one interface.
///
/// The transaction id is drawn once and kept across restarts.
#[derive(Debug, Clone)]
pub struct DhcpClient {
    xid: u32,
    mac: MacAddr,
    hostname: Option<String>,
    state: State,
}

impl DhcpClient {
    /// Creates a client with a random nonzero transaction id.
    #[must_use]
    pub fn new(mac: MacAddr, hostname: Option<String>) -> Self {
        let xid = rand::thread_rng().gen_range(1..=u32::MAX);
        Self::with_xid(mac, hostname, NonZeroU32::new(xid).unwrap_or(NonZeroU32::MIN))
    }

    /// Creates a client with a fixed transaction id.
    #[must_use]
    pub fn with_xid(mac: MacAddr, hostname: Option<String>, xid: NonZeroU32) -> Self {
        Self {
            xid: xid.get(),
            mac,
            hostname,
            state: State::Init,
        }
    }

    /// Transaction id used for every message.
    #[must_use]
    pub const fn xid(&self) -> u32 {
        self.xid
    }

    /// Hardware address the client speaks for.
    #[must_use]
    pub const fn mac(&self) -> MacAddr {
        self.mac
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &State {
        &self.state
    }

    /// Forgets any offer or lease and returns the DISCOVER to broadcast.
    pub fn discover(&mut self) -> Vec<u8> {
        self.state = State::Selecting;
        tracing::debug!(xid = self.xid, "sending DHCP discover");
        encode_frame(
            &self.header(Ipv4Addr::UNSPECIFIED),
            &[DhcpOption::MessageType(MessageType::Discover)],
        )
    }

    fn request(&self, offered: Ipv4Addr, server: Ipv4Addr) -> Vec<u8> {
        let mut options = vec![
            DhcpOption::MessageType(MessageType::Request),
            DhcpOption::Address(tag::REQUESTED_IP, offered),
            DhcpOption::Address(tag::SERVER_ID, server),
            DhcpOption::ParameterList(REQUESTED_PARAMETERS.to_vec()),
        ];
        if let Some(name) = &self.hostname {
            options.push(DhcpOption::Raw(tag::HOST_NAME, name.as_bytes().to_vec()));
        }
        encode_frame(&self.header(server), &options)
    }

    const fn header(&self, siaddr: Ipv4Addr) -> Header {
        Header {
            op: Op::Request,
            xid: self.xid,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr,
            chaddr: self.mac,
        }
    }

    /// Feeds one received frame to the state machine.
    pub fn handle(&mut self, frame: &[u8]) -> Step {
        let Some(packet) = decode_frame(frame) else {
            return Step::Ignore;
        };
        if packet.header.op != Op::Reply
            || packet.header.xid != self.xid
            || packet.header.chaddr != self.mac
        {
            return Step::Ignore;
        }
        let Some(kind) = packet.options.message_type() else {
            tracing::debug!("DHCP reply without message type");
            return Step::Ignore;
        };

        match (self.state.clone(), kind) {
            (State::Selecting, MessageType::Offer) => {
                let offered = packet.header.yiaddr;
                if offered.is_unspecified() {
                    return Step::Ignore;
                }
                let server = packet
                    .options
                    .address(tag::SERVER_ID)
                    .unwrap_or(packet.header.siaddr);
                tracing::debug!(%offered, %server, "DHCP offer, requesting");
                self.state = State::Requesting { offered, server };
                Step::Send(self.request(offered, server))
            }
            (State::Requesting { .. }, MessageType::Offer) => Step::Ignore,
            (State::Requesting { offered, server }, MessageType::Ack) => {
                match Lease::from_ack(&packet, offered, server) {
                    Some(lease) => {
                        tracing::info!(
                            address = %lease.address,
                            lease_secs = lease.lease_secs,
                            "DHCP lease bound"
                        );
                        self.state = State::Bound(lease.clone());
                        Step::Bound(lease)
                    }
                    None => {
                        tracing::warn!("DHCP ack without subnet mask or lease time, ignoring");
                        Step::Ignore
                    }
                }
            }
            (State::Requesting { .. }, other) => {
                tracing::warn!(?other, "DHCP request refused, starting over");
                Step::Send(self.discover())
            }
            _ => Step::Ignore,
        }
    }
}
