use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use multiaddr::{Multiaddr, Protocol};

use crate::errors::{Result, TransportError};

/// Parses a `/ip{4,6}/<ip>/udp/<port>/quic` multiaddress into a socket
/// address. A leading protocol other than `ip4`/`ip6` is a different network
/// family; anything else malformed is an invalid address.
pub fn multiaddr_to_socketaddr(addr: &Multiaddr) -> Result<SocketAddr> {
    let mut iter = addr.iter();

    let ip = match iter.next() {
        Some(Protocol::Ip4(ip)) => IpAddr::V4(ip),
        Some(Protocol::Ip6(ip)) => IpAddr::V6(ip),
        Some(_) => return Err(TransportError::InvalidNetwork),
        None => return Err(TransportError::InvalidAddress("empty multiaddr".to_string())),
    };

    let port = match iter.next() {
        Some(Protocol::Udp(port)) => port,
        _ => {
            return Err(TransportError::InvalidAddress(format!(
                "expected /udp after ip in {addr}"
            )))
        }
    };

    if !matches!(iter.next(), Some(Protocol::Quic)) {
        return Err(TransportError::InvalidAddress(format!(
            "expected /quic after udp port in {addr}"
        )));
    }
    if iter.next().is_some() {
        return Err(TransportError::InvalidAddress(format!(
            "trailing protocols after /quic in {addr}"
        )));
    }

    Ok(SocketAddr::new(ip, port))
}

/// Renders a socket address as a `/ip{4,6}/<ip>/udp/<port>/quic`
/// multiaddress.
pub fn socketaddr_to_multiaddr(addr: &SocketAddr) -> Multiaddr {
    Multiaddr::from(addr.ip())
        .with(Protocol::Udp(addr.port()))
        .with(Protocol::Quic)
}

/// Like [`socketaddr_to_multiaddr`], but replaces an unspecified host with
/// the loopback of the matching family. Listeners may carry unspecified
/// addresses; connections must not.
pub fn local_multiaddr(addr: &SocketAddr) -> Multiaddr {
    let ip = match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    socketaddr_to_multiaddr(&SocketAddr::new(ip, addr.port()))
}

/// Whether this transport can claim the address.
pub fn is_quic_multiaddr(addr: &Multiaddr) -> bool {
    multiaddr_to_socketaddr(addr).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_v4() {
        let addr: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let ma = socketaddr_to_multiaddr(&addr);
        assert_eq!(ma.to_string(), "/ip4/127.0.0.1/udp/4001/quic");
        assert_eq!(multiaddr_to_socketaddr(&ma).unwrap(), addr);
    }

    #[test]
    fn test_round_trip_v6() {
        let addr: SocketAddr = "[::1]:4001".parse().unwrap();
        let ma = socketaddr_to_multiaddr(&addr);
        assert_eq!(ma.to_string(), "/ip6/::1/udp/4001/quic");
        assert_eq!(multiaddr_to_socketaddr(&ma).unwrap(), addr);
    }

    #[test]
    fn test_unspecified_resolves_to_loopback() {
        let v4: SocketAddr = "0.0.0.0:4001".parse().unwrap();
        assert_eq!(
            local_multiaddr(&v4).to_string(),
            "/ip4/127.0.0.1/udp/4001/quic"
        );

        let v6: SocketAddr = "[::]:4001".parse().unwrap();
        assert_eq!(local_multiaddr(&v6).to_string(), "/ip6/::1/udp/4001/quic");

        // Specified hosts pass through untouched.
        let specified: SocketAddr = "192.0.2.1:4001".parse().unwrap();
        assert_eq!(
            local_multiaddr(&specified).to_string(),
            "/ip4/192.0.2.1/udp/4001/quic"
        );
    }

    #[test]
    fn test_rejects_malformed() {
        let tcp: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert!(matches!(
            multiaddr_to_socketaddr(&tcp),
            Err(TransportError::InvalidAddress(_))
        ));

        let no_quic: Multiaddr = "/ip4/127.0.0.1/udp/4001".parse().unwrap();
        assert!(matches!(
            multiaddr_to_socketaddr(&no_quic),
            Err(TransportError::InvalidAddress(_))
        ));

        let trailing: Multiaddr = "/ip4/127.0.0.1/udp/4001/quic/tcp/1".parse().unwrap();
        assert!(matches!(
            multiaddr_to_socketaddr(&trailing),
            Err(TransportError::InvalidAddress(_))
        ));

        let dns: Multiaddr = "/dns4/example.com/udp/4001/quic".parse().unwrap();
        assert!(matches!(
            multiaddr_to_socketaddr(&dns),
            Err(TransportError::InvalidNetwork)
        ));
    }

    #[test]
    fn test_is_quic_multiaddr() {
        let good: Multiaddr = "/ip6/::1/udp/4001/quic".parse().unwrap();
        assert!(is_quic_multiaddr(&good));

        let bad: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert!(!is_quic_multiaddr(&bad));
    }
}
