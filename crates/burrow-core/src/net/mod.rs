//! Container networking.
//!
//! A macvlan sub-interface of a host link is created directly inside the
//! container's network namespace and configured with an address leased over
//! DHCP. Everything talks to the kernel through rtnetlink and a packet
//! socket; no external tools are involved.

pub mod dhcp;
pub mod macvlan;
pub mod netlink;
pub mod resolv;
