//! Local address discovery
//!
//! Asks the OS which source address it would use to reach a public host.
//! Connecting a UDP socket only selects a route; no datagram is sent.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Probe destinations used for route selection
const PROBE_V4: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53);
const PROBE_V6: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0x2606, 0x4700, 0x4700, 0, 0, 0, 0, 0x1111)),
    53,
);

/// Best-effort discovery of the address this host reaches the network from.
///
/// Prefers IPv4, falls back to IPv6, and returns `None` when neither family
/// has a usable route.
pub fn detect_address() -> Option<IpAddr> {
    [PROBE_V4, PROBE_V6].into_iter().find_map(|probe| {
        match route_source(probe) {
            Ok(addr) if is_usable(addr) => Some(addr),
            Ok(addr) => {
                tracing::debug!("Ignoring unusable source address {} for {}", addr, probe);
                None
            }
            Err(e) => {
                tracing::debug!("No route towards {}: {}", probe, e);
                None
            }
        }
    })
}

/// Source address the OS picks for `probe`
fn route_source(probe: SocketAddr) -> std::io::Result<IpAddr> {
    let domain = if probe.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.connect(&SockAddr::from(probe))?;

    socket
        .local_addr()?
        .as_socket()
        .map(|addr| addr.ip())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "non-IP local address"))
}

fn is_usable(addr: IpAddr) -> bool {
    !addr.is_loopback() && !addr.is_unspecified()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detected_address_is_usable() {
        // Sandboxes may have no route at all; only check what comes back
        if let Some(addr) = detect_address() {
            assert!(is_usable(addr));
        }
    }

    #[test]
    fn test_is_usable() {
        assert!(!is_usable(IpAddr::V4(Ipv4Addr::LOCALHOST)));
        assert!(!is_usable(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        assert!(!is_usable(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert!(is_usable(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20))));
    }
}
