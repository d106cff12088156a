//! Resolver configuration written once a lease is bound.

use std::fmt::Write as _;
use std::net::Ipv4Addr;

/// Renders `/etc/resolv.conf`: one `nameserver` line per server (just the
/// override when there is one) and a `search` line for the domain.
#[must_use]
pub fn render(servers: &[Ipv4Addr], domain: Option<&str>, dns_override: Option<Ipv4Addr>) -> String {
    let mut out = String::new();
    match dns_override {
        Some(server) => {
            let _ = writeln!(out, "nameserver {server}");
        }
        None => {
            for server in servers {
                let _ = writeln!(out, "nameserver {server}");
            }
        }
    }
    if let Some(domain) = domain.filter(|d| !d.is_empty()) {
        let _ = writeln!(out, "search {domain}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    #[test]
    fn lists_every_offered_server() {
        assert_eq!(
            render(&[A, B], Some("lan"), None),
            "nameserver 10.0.0.1\nnameserver 10.0.0.2\nsearch lan\n"
        );
    }

    #[test]
    fn override_replaces_offered_servers() {
        let dns = Ipv4Addr::new(9, 9, 9, 9);
        assert_eq!(render(&[A, B], None, Some(dns)), "nameserver 9.9.9.9\n");
    }

    #[test]
    fn nothing_offered_yields_empty_file() {
        assert_eq!(render(&[], None, None), "");
    }
}
