use libp2p_identity::{Keypair, PeerId, PublicKey};
use multiaddr::Multiaddr;
use tracing::debug;

use crate::errors::{from_connection_error, Result, CLOSE_CODE_ORDERLY};
use crate::reuse::SocketRef;
use crate::stream::Stream;

/// An authenticated QUIC session with a verified remote peer.
///
/// Every connection, dialed or accepted, borrows the socket it runs on; a
/// monitor task waits for session termination and hands the reference back
/// to the reuse registry exactly once, so the socket outlives the session
/// no matter who else released theirs.
#[derive(Debug)]
pub struct Connection {
    session: quinn::Connection,
    keypair: Keypair,
    local_peer: PeerId,
    remote_peer: PeerId,
    remote_public_key: PublicKey,
    local_addr: std::net::SocketAddr,
    local_multiaddr: Multiaddr,
    remote_multiaddr: Multiaddr,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session: quinn::Connection,
        socket: SocketRef,
        keypair: Keypair,
        local_peer: PeerId,
        remote_peer: PeerId,
        remote_public_key: PublicKey,
        local_addr: std::net::SocketAddr,
        local_multiaddr: Multiaddr,
        remote_multiaddr: Multiaddr,
    ) -> Self {
        let monitored = session.clone();
        tokio::spawn(async move {
            let reason = monitored.closed().await;
            debug!("Session with {} terminated: {}", remote_peer, reason);
            drop(socket);
        });

        Self {
            session,
            keypair,
            local_peer,
            remote_peer,
            remote_public_key,
            local_addr,
            local_multiaddr,
            remote_multiaddr,
        }
    }

    /// Opens a new outbound stream, waiting for a slot when the peer's
    /// stream limit is exhausted. Dropping the future abandons the attempt
    /// without consuming a slot.
    pub async fn open_stream(&self) -> Result<Stream> {
        let (send, recv) = self
            .session
            .open_bi()
            .await
            .map_err(from_connection_error)?;
        Ok(Stream::new(send, recv))
    }

    /// Waits for the next peer-initiated stream. Returns an error once the
    /// session has closed.
    pub async fn accept_stream(&self) -> Result<Stream> {
        let (send, recv) = self
            .session
            .accept_bi()
            .await
            .map_err(from_connection_error)?;
        Ok(Stream::new(send, recv))
    }

    /// Initiates a graceful close. In-flight stream operations complete
    /// with a connection-closed error.
    pub fn close(&self) {
        self.session
            .close(CLOSE_CODE_ORDERLY.into(), b"");
    }

    pub fn is_closed(&self) -> bool {
        self.session.close_reason().is_some()
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    pub fn remote_peer(&self) -> PeerId {
        self.remote_peer
    }

    pub fn local_private_key(&self) -> &Keypair {
        &self.keypair
    }

    pub fn remote_public_key(&self) -> &PublicKey {
        &self.remote_public_key
    }

    pub fn local_multiaddr(&self) -> &Multiaddr {
        &self.local_multiaddr
    }

    pub fn remote_multiaddr(&self) -> &Multiaddr {
        &self.remote_multiaddr
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> std::net::SocketAddr {
        self.session.remote_address()
    }
}
