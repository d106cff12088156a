//! DHCP over IPv4/UDP, framed for a `SOCK_DGRAM` packet socket (the kernel
//! adds and strips the Ethernet header).
//!
//! Layout: IPv4 header (20 bytes, no options when sending), UDP header
//! (8 bytes, checksum left at zero), BOOTP header with magic cookie
//! (240 bytes), then the option area.

use std::net::Ipv4Addr;

use burrow_common::types::MacAddr;

/// Port the server listens on.
pub const SERVER_PORT: u16 = 67;
/// Port the client listens on.
pub const CLIENT_PORT: u16 = 68;
/// Marks the start of the DHCP option area.
pub const MAGIC_COOKIE: u32 = 0x6382_5363;

const IP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const BOOTP_LEN: usize = 240;
const IPPROTO_UDP: u8 = 17;
const TTL: u8 = 16;

/// Frames shorter than this cannot hold a DHCP message with at least the
/// end-of-options tag.
pub const MIN_FRAME_LEN: usize = IP_HEADER_LEN + UDP_HEADER_LEN + BOOTP_LEN + 1;

/// Option tags the client uses.
pub mod tag {
    /// Padding, no length byte.
    pub const PAD: u8 = 0;
    /// Subnet mask.
    pub const SUBNET_MASK: u8 = 1;
    /// Default routers.
    pub const ROUTER: u8 = 3;
    /// DNS servers.
    pub const DOMAIN_NAME_SERVER: u8 = 6;
    /// Client host name.
    pub const HOST_NAME: u8 = 12;
    /// Domain name, used as the resolver search domain.
    pub const DOMAIN_NAME: u8 = 15;
    /// Broadcast address.
    pub const BROADCAST: u8 = 28;
    /// Address asked for in a REQUEST.
    pub const REQUESTED_IP: u8 = 50;
    /// Lease duration in seconds.
    pub const LEASE_TIME: u8 = 51;
    /// DHCP message type.
    pub const MESSAGE_TYPE: u8 = 53;
    /// Address of the server that made the offer.
    pub const SERVER_ID: u8 = 54;
    /// Options the client wants in the answer.
    pub const PARAMETER_LIST: u8 = 55;
    /// End of the option area, no length byte.
    pub const END: u8 = 255;
}

/// BOOTP direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Client to server.
    Request,
    /// Server to client.
    Reply,
}

impl Op {
    const fn code(self) -> u8 {
        match self {
            Self::Request => 1,
            Self::Reply => 2,
        }
    }

    const fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Request),
            2 => Some(Self::Reply),
            _ => None,
        }
    }

    /// `(source, destination)` UDP ports for this direction.
    const fn ports(self) -> (u16, u16) {
        match self {
            Self::Request => (CLIENT_PORT, SERVER_PORT),
            Self::Reply => (SERVER_PORT, CLIENT_PORT),
        }
    }
}

/// DHCP message type (option 53).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Client looking for servers.
    Discover,
    /// Server offering an address.
    Offer,
    /// Client asking for the offered address.
    Request,
    /// Client refusing an address already in use.
    Decline,
    /// Server confirming the lease.
    Ack,
    /// Server refusing the request.
    Nak,
    /// Client giving the address back.
    Release,
    /// Client asking for configuration only.
    Inform,
}

impl MessageType {
    /// Wire value of this type.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Discover => 1,
            Self::Offer => 2,
            Self::Request => 3,
            Self::Decline => 4,
            Self::Ack => 5,
            Self::Nak => 6,
            Self::Release => 7,
            Self::Inform => 8,
        }
    }

    /// Decodes a wire value.
    #[must_use]
    pub const fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }
}

/// One option to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    /// Option 53.
    MessageType(MessageType),
    /// Any option whose value is a single IPv4 address.
    Address(u8, Ipv4Addr),
    /// Option 55.
    ParameterList(Vec<u8>),
    /// Any other option, value given verbatim.
    Raw(u8, Vec<u8>),
}

impl DhcpOption {
    /// Tag of the option.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::MessageType(_) => tag::MESSAGE_TYPE,
            Self::ParameterList(_) => tag::PARAMETER_LIST,
            Self::Address(tag, _) | Self::Raw(tag, _) => *tag,
        }
    }

    fn value(&self) -> Vec<u8> {
        match self {
            Self::MessageType(kind) => vec![kind.code()],
            Self::Address(_, addr) => addr.octets().to_vec(),
            Self::ParameterList(tags) => tags.clone(),
            Self::Raw(_, bytes) => bytes.clone(),
        }
    }
}

/// Serializes `options` as tag-length-value records followed by the end tag.
/// Values longer than 255 bytes are truncated.
#[must_use]
pub fn encode_options(options: &[DhcpOption]) -> Vec<u8> {
    let mut out = Vec::new();
    for option in options {
        let value = option.value();
        let len = value.len().min(usize::from(u8::MAX));
        out.push(option.tag());
        out.push(u8::try_from(len).unwrap_or(u8::MAX));
        out.extend_from_slice(&value[..len]);
    }
    out.push(tag::END);
    out
}

/// Decoded option area.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Options(Vec<(u8, Vec<u8>)>);

impl Options {
    /// Parses an option area. Parsing stops at the end tag or at the first
    /// truncated record.
    #[must_use]
    pub fn parse(data: &[u8]) -> Self {
        let mut records = Vec::new();
        let mut i = 0;
        while let Some(&tag) = data.get(i) {
            match tag {
                tag::END => break,
                tag::PAD => i += 1,
                _ => {
                    let Some(&len) = data.get(i + 1) else { break };
                    let start = i + 2;
                    let Some(value) = data.get(start..start + usize::from(len)) else {
                        break;
                    };
                    records.push((tag, value.to_vec()));
                    i = start + usize::from(len);
                }
            }
        }
        Self(records)
    }

    /// Raw value of the first occurrence of `tag`.
    #[must_use]
    pub fn get(&self, tag: u8) -> Option<&[u8]> {
        self.0.iter().find(|(t, _)| *t == tag).map(|(_, v)| v.as_slice())
    }

    /// Decoded message type.
    #[must_use]
    pub fn message_type(&self) -> Option<MessageType> {
        match self.get(tag::MESSAGE_TYPE)? {
            [code] => MessageType::from_code(*code),
            _ => None,
        }
    }

    /// First address carried by `tag`.
    #[must_use]
    pub fn address(&self, tag: u8) -> Option<Ipv4Addr> {
        self.addresses(tag).into_iter().next()
    }

    /// Every address carried by `tag`; trailing partial addresses are
    /// dropped.
    #[must_use]
    pub fn addresses(&self, tag: u8) -> Vec<Ipv4Addr> {
        self.get(tag)
            .map(|v| {
                v.chunks_exact(4)
                    .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Big-endian 32-bit value carried by `tag`.
    #[must_use]
    pub fn u32(&self, tag: u8) -> Option<u32> {
        let bytes: [u8; 4] = self.get(tag)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Text carried by `tag`, with trailing NULs removed.
    #[must_use]
    pub fn text(&self, tag: u8) -> Option<String> {
        let value = self.get(tag)?;
        let text = String::from_utf8_lossy(value);
        Some(text.trim_end_matches('\0').to_string())
    }
}

/// The BOOTP fields the client reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Direction.
    pub op: Op,
    /// Transaction id.
    pub xid: u32,
    /// Address offered to or assigned to the client.
    pub yiaddr: Ipv4Addr,
    /// Server address.
    pub siaddr: Ipv4Addr,
    /// Client hardware address.
    pub chaddr: MacAddr,
}

/// A received DHCP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Fixed header fields.
    pub header: Header,
    /// Option area.
    pub options: Options,
}

/// RFC 1071 internet checksum.
#[must_use]
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|c| u32::from(u16::from_be_bytes([c[0], c.get(1).copied().unwrap_or(0)])))
        .sum();
    while sum > 0xffff {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    #[allow(clippy::cast_possible_truncation)]
    let folded = sum as u16;
    !folded
}

/// Builds a broadcast IPv4/UDP frame carrying a DHCP message.
///
/// Requests go from 0.0.0.0:68 to 255.255.255.255:67; replies come from the
/// server address on port 67.
#[must_use]
pub fn encode_frame(header: &Header, options: &[DhcpOption]) -> Vec<u8> {
    let opts = encode_options(options);
    let udp_len = UDP_HEADER_LEN + BOOTP_LEN + opts.len();
    let total_len = IP_HEADER_LEN + udp_len;
    let mut frame = vec![0u8; total_len];

    let source = match header.op {
        Op::Request => Ipv4Addr::UNSPECIFIED,
        Op::Reply => header.siaddr,
    };
    let (src_port, dst_port) = header.op.ports();

    let ip = &mut frame[..IP_HEADER_LEN];
    ip[0] = 0x45; // version 4, 5 words
    ip[2..4].copy_from_slice(&u16::try_from(total_len).unwrap_or(u16::MAX).to_be_bytes());
    ip[8] = TTL;
    ip[9] = IPPROTO_UDP;
    ip[12..16].copy_from_slice(&source.octets());
    ip[16..20].copy_from_slice(&Ipv4Addr::BROADCAST.octets());
    let sum = checksum(ip);
    ip[10..12].copy_from_slice(&sum.to_be_bytes());

    let udp = &mut frame[IP_HEADER_LEN..IP_HEADER_LEN + UDP_HEADER_LEN];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&u16::try_from(udp_len).unwrap_or(u16::MAX).to_be_bytes());

    let bootp_start = IP_HEADER_LEN + UDP_HEADER_LEN;
    let bootp = &mut frame[bootp_start..bootp_start + BOOTP_LEN];
    bootp[0] = header.op.code();
    bootp[1] = 1; // htype: Ethernet
    bootp[2] = 6; // hlen
    bootp[4..8].copy_from_slice(&header.xid.to_be_bytes());
    bootp[16..20].copy_from_slice(&header.yiaddr.octets());
    bootp[20..24].copy_from_slice(&header.siaddr.octets());
    bootp[28..34].copy_from_slice(&header.chaddr.octets());
    bootp[236..240].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());

    frame[bootp_start + BOOTP_LEN..].copy_from_slice(&opts);
    frame
}

/// Decodes a frame received on the packet socket.
///
/// Returns `None` for anything that is not a DHCP message travelling in the
/// direction its op code claims: too short, not UDP, wrong port, missing
/// magic cookie. The link carries plenty of such traffic.
#[must_use]
pub fn decode_frame(frame: &[u8]) -> Option<Packet> {
    if frame.len() < MIN_FRAME_LEN || frame[0] >> 4 != 4 || frame[9] != IPPROTO_UDP {
        return None;
    }
    let ihl = usize::from(frame[0] & 0x0f) * 4;
    if ihl < IP_HEADER_LEN {
        return None;
    }
    let bootp_start = ihl + UDP_HEADER_LEN;
    let bootp = frame.get(bootp_start..bootp_start + BOOTP_LEN)?;

    let op = Op::from_code(bootp[0])?;
    let dst_port = u16::from_be_bytes([frame[ihl + 2], frame[ihl + 3]]);
    if dst_port != op.ports().1 {
        return None;
    }
    if u32::from_be_bytes([bootp[236], bootp[237], bootp[238], bootp[239]]) != MAGIC_COOKIE {
        return None;
    }

    let addr = |at: usize| Ipv4Addr::new(bootp[at], bootp[at + 1], bootp[at + 2], bootp[at + 3]);
    let mut chaddr = [0u8; 6];
    chaddr.copy_from_slice(&bootp[28..34]);

    Some(Packet {
        header: Header {
            op,
            xid: u32::from_be_bytes([bootp[4], bootp[5], bootp[6], bootp[7]]),
            yiaddr: addr(16),
            siaddr: addr(20),
            chaddr: MacAddr(chaddr),
        },
        options: Options::parse(&frame[bootp_start + BOOTP_LEN..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);

    fn request_header() -> Header {
        Header {
            op: Op::Request,
            xid: 0xdead_beef,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            chaddr: MAC,
        }
    }

    #[test]
    fn options_are_tag_length_value_with_end() {
        let bytes = encode_options(&[
            DhcpOption::MessageType(MessageType::Request),
            DhcpOption::Address(tag::REQUESTED_IP, Ipv4Addr::new(10, 0, 0, 5)),
            DhcpOption::ParameterList(vec![1, 3, 6, 15]),
            DhcpOption::Raw(tag::HOST_NAME, b"web".to_vec()),
        ]);
        assert_eq!(
            bytes,
            vec![
                53, 1, 3, //
                50, 4, 10, 0, 0, 5, //
                55, 4, 1, 3, 6, 15, //
                12, 3, b'w', b'e', b'b', //
                255,
            ]
        );
    }

    #[test]
    fn parser_skips_padding_and_stops_at_end() {
        let opts = Options::parse(&[0, 0, 53, 1, 2, 0, 1, 4, 255, 255, 255, 0, 255, 3, 4, 1, 1, 1, 1]);
        assert_eq!(opts.message_type(), Some(MessageType::Offer));
        assert_eq!(opts.address(tag::SUBNET_MASK), Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(opts.get(tag::ROUTER), None);
    }

    #[test]
    fn parser_tolerates_truncated_record() {
        let opts = Options::parse(&[53, 1, 5, 6, 8, 1, 1, 1, 1]);
        assert_eq!(opts.message_type(), Some(MessageType::Ack));
        assert!(opts.addresses(tag::DOMAIN_NAME_SERVER).is_empty());
    }

    #[test]
    fn multiple_addresses_and_text() {
        let opts = Options::parse(&[6, 8, 1, 1, 1, 1, 8, 8, 8, 8, 15, 4, b'l', b'a', b'n', 0, 255]);
        assert_eq!(
            opts.addresses(tag::DOMAIN_NAME_SERVER),
            vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]
        );
        assert_eq!(opts.text(tag::DOMAIN_NAME).as_deref(), Some("lan"));
    }

    #[test]
    fn request_frame_layout() {
        let frame = encode_frame(&request_header(), &[DhcpOption::MessageType(MessageType::Discover)]);
        assert_eq!(frame.len(), MIN_FRAME_LEN + 3);
        assert_eq!(frame[0], 0x45);
        assert_eq!(frame[8], 16);
        assert_eq!(&frame[16..20], &[255, 255, 255, 255]);
        assert_eq!(u16::from_be_bytes([frame[20], frame[21]]), CLIENT_PORT);
        assert_eq!(u16::from_be_bytes([frame[22], frame[23]]), SERVER_PORT);
        assert_eq!(&frame[26..28], &[0, 0], "UDP checksum is left out");
        assert_eq!(checksum(&frame[..20]), 0, "IP header checksum must verify");
    }

    #[test]
    fn decoding_a_reply() {
        let header = Header {
            op: Op::Reply,
            yiaddr: Ipv4Addr::new(10, 0, 0, 5),
            siaddr: Ipv4Addr::new(10, 0, 0, 1),
            ..request_header()
        };
        let frame = encode_frame(&header, &[DhcpOption::MessageType(MessageType::Offer)]);
        let packet = decode_frame(&frame).expect("valid reply");
        assert_eq!(packet.header, header);
        assert_eq!(packet.options.message_type(), Some(MessageType::Offer));
    }

    #[test]
    fn ip_options_are_honoured() {
        let mut frame = encode_frame(&request_header(), &[DhcpOption::MessageType(MessageType::Discover)]);
        // Grow the IP header to six words with a NOP option word.
        frame[0] = 0x46;
        frame.splice(20..20, [1, 1, 1, 0]);
        let packet = decode_frame(&frame).expect("decoded");
        assert_eq!(packet.header.xid, 0xdead_beef);
    }

    #[test]
    fn foreign_traffic_is_rejected() {
        let good = encode_frame(&request_header(), &[DhcpOption::MessageType(MessageType::Discover)]);

        assert!(decode_frame(&good[..MIN_FRAME_LEN - 1]).is_none());

        let mut tcp = good.clone();
        tcp[9] = 6;
        assert!(decode_frame(&tcp).is_none());

        let mut port = good.clone();
        port[23] = 53;
        assert!(decode_frame(&port).is_none());

        let mut cookie = good;
        cookie[20 + 8 + 236] = 0;
        assert!(decode_frame(&cookie).is_none());
    }
}
