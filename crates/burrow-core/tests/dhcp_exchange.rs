//! Full DHCP exchanges against a scripted server.

use std::net::Ipv4Addr;
use std::num::NonZeroU32;
use std::time::Duration;

use burrow_common::types::MacAddr;
use burrow_core::net::dhcp::packet::{
    DhcpOption, Header, MessageType, Op, Packet, decode_frame, encode_frame, tag,
};
use burrow_core::net::dhcp::{DhcpClient, State, Step};

const MAC: MacAddr = MacAddr([0x02, 0x42, 0x0a, 0x00, 0x00, 0x09]);
const SERVER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const POOL_ADDRESS: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);

/// Answers like a small home router would.
struct ScriptedServer {
    lease_secs: u32,
    refuse_requests: usize,
}

impl ScriptedServer {
    fn new(lease_secs: u32) -> Self {
        Self {
            lease_secs,
            refuse_requests: 0,
        }
    }

    fn answer(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        let Packet { header, options } = decode_frame(frame)?;
        assert_eq!(header.op, Op::Request, "server only sees client frames");
        let kind = options.message_type()?;
        let (reply_kind, extra) = match kind {
            MessageType::Discover => (MessageType::Offer, vec![]),
            MessageType::Request if self.refuse_requests > 0 => {
                self.refuse_requests -= 1;
                (MessageType::Nak, vec![])
            }
            MessageType::Request => {
                assert_eq!(options.address(tag::REQUESTED_IP), Some(POOL_ADDRESS));
                assert_eq!(options.address(tag::SERVER_ID), Some(SERVER));
                (
                    MessageType::Ack,
                    vec![
                        DhcpOption::Address(tag::SUBNET_MASK, Ipv4Addr::new(255, 255, 255, 0)),
                        DhcpOption::Address(tag::ROUTER, SERVER),
                        DhcpOption::Raw(
                            tag::DOMAIN_NAME_SERVER,
                            [[1, 1, 1, 1], [9, 9, 9, 9]].concat(),
                        ),
                        DhcpOption::Raw(tag::DOMAIN_NAME, b"home.arpa".to_vec()),
                        DhcpOption::Raw(tag::LEASE_TIME, self.lease_secs.to_be_bytes().to_vec()),
                    ],
                )
            }
            _ => return None,
        };
        let mut reply_options = vec![
            DhcpOption::MessageType(reply_kind),
            DhcpOption::Address(tag::SERVER_ID, SERVER),
        ];
        reply_options.extend(extra);
        Some(encode_frame(
            &Header {
                op: Op::Reply,
                xid: header.xid,
                yiaddr: POOL_ADDRESS,
                siaddr: SERVER,
                chaddr: header.chaddr,
            },
            &reply_options,
        ))
    }
}

fn client() -> DhcpClient {
    DhcpClient::with_xid(MAC, Some("box".into()), NonZeroU32::new(0x1234).expect("nonzero"))
}

/// Runs the exchange until the client binds or stops talking.
fn run(client: &mut DhcpClient, server: &mut ScriptedServer) -> Option<burrow_core::net::dhcp::Lease> {
    let mut outgoing = client.discover();
    for _ in 0..16 {
        let reply = server.answer(&outgoing)?;
        match client.handle(&reply) {
            Step::Send(frame) => outgoing = frame,
            Step::Bound(lease) => return Some(lease),
            Step::Ignore => return None,
        }
    }
    None
}

#[test]
fn four_message_exchange_binds_a_lease() {
    let mut c = client();
    let lease = run(&mut c, &mut ScriptedServer::new(3600)).expect("lease");

    assert_eq!(lease.address, POOL_ADDRESS);
    assert_eq!(lease.netmask, Ipv4Addr::new(255, 255, 255, 0));
    assert_eq!(lease.broadcast, Ipv4Addr::new(10, 0, 0, 255));
    assert_eq!(lease.router, Some(SERVER));
    assert_eq!(lease.dns, vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(9, 9, 9, 9)]);
    assert_eq!(lease.domain.as_deref(), Some("home.arpa"));
    assert_eq!(lease.server, SERVER);
    assert!(matches!(c.state(), State::Bound(_)));
}

#[test]
fn hundred_second_lease_renews_at_ninety_seconds() {
    let lease = run(&mut client(), &mut ScriptedServer::new(100)).expect("lease");
    assert_eq!(lease.renewal_after(), Duration::from_secs(90));
}

#[test]
fn refused_request_starts_over_and_still_binds() {
    let mut server = ScriptedServer::new(600);
    server.refuse_requests = 1;
    let lease = run(&mut client(), &mut server).expect("lease after one refusal");
    assert_eq!(lease.address, POOL_ADDRESS);
}

#[test]
fn reply_for_another_transaction_changes_nothing() {
    let mut c = client();
    let discover = c.discover();
    let mut other = DhcpClient::with_xid(MAC, None, NonZeroU32::new(0x9999).expect("nonzero"));
    let foreign_offer = ScriptedServer::new(60)
        .answer(&other.discover())
        .expect("offer");

    assert_eq!(c.handle(&foreign_offer), Step::Ignore);
    assert_eq!(c.state(), &State::Selecting);

    let offer = ScriptedServer::new(60).answer(&discover).expect("offer");
    assert!(matches!(c.handle(&offer), Step::Send(_)));
}

#[test]
fn restart_rediscovers_with_the_same_transaction() {
    let mut c = client();
    let _ = run(&mut c, &mut ScriptedServer::new(60)).expect("lease");

    let again = decode_frame(&c.discover()).expect("discover decodes");
    assert_eq!(again.options.message_type(), Some(MessageType::Discover));
    assert_eq!(again.header.xid, 0x1234);
    assert_eq!(c.state(), &State::Selecting);
}
