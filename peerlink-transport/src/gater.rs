use libp2p_identity::PeerId;
use multiaddr::Multiaddr;

/// Direction of a connection, from the local node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Admission-control policy consulted by the transport.
///
/// `intercept_accept` runs on the packet-reading path for every long-header
/// datagram from an unknown flow, before the QUIC engine sees it;
/// `intercept_secured` runs once per accepted session, after the handshake
/// verified the peer. Implementations are called concurrently and must not
/// block on I/O.
pub trait ConnectionGater: Send + Sync {
    /// Whether a flow from `remote` may reach the QUIC engine at all.
    /// Rejected packets are silently dropped; the dialer sees a timeout.
    fn intercept_accept(&self, local: &Multiaddr, remote: &Multiaddr) -> bool;

    /// Whether a session with a verified peer identity may be admitted.
    fn intercept_secured(
        &self,
        direction: Direction,
        peer: &PeerId,
        local: &Multiaddr,
        remote: &Multiaddr,
    ) -> bool;
}
