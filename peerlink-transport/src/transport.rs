use std::sync::Arc;

use libp2p_identity::{Keypair, PeerId};
use multiaddr::{Multiaddr, Protocol};
use peerlink_identity::Identity;
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use quinn::{EndpointConfig, TransportConfig};
use tracing::{debug, info};

use crate::addr::{is_quic_multiaddr, local_multiaddr, multiaddr_to_socketaddr};
use crate::config::QuicConfig;
use crate::connection::Connection;
use crate::errors::{from_handshake_error, Result, TransportError};
use crate::gater::ConnectionGater;
use crate::listener::Listener;
use crate::reuse::SocketManager;
use crate::token_store::MemoryTokenStore;

/// A pre-shared key for a private libp2p network. QUIC cannot run behind
/// packet-level PSK protection, so supplying one fails construction.
pub type PreSharedKey = [u8; 32];

/// Domain separator for the stateless-reset key derivation.
const STATELESS_RESET_KEY_INFO: &[u8] = b"libp2p quic stateless reset key";

/// QUIC transport between peer identities.
///
/// Dialing takes a multiaddress plus the expected peer ID and only yields a
/// connection once the TLS handshake proved the remote controls that
/// identity. A single UDP socket per endpoint backs both listening and
/// dialing through the reuse registry.
///
/// # Example
///
/// ```no_run
/// use libp2p_identity::Keypair;
/// use peerlink_transport::{QuicConfig, QuicTransport};
///
/// # async fn run() -> peerlink_transport::Result<()> {
/// let keypair = Keypair::generate_ed25519();
/// let transport = QuicTransport::new(&keypair, None, None, QuicConfig::default())?;
///
/// let listener = transport.listen(&"/ip4/0.0.0.0/udp/0/quic".parse().unwrap())?;
/// let connection = listener.accept().await?;
/// # Ok(())
/// # }
/// ```
pub struct QuicTransport {
    keypair: Keypair,
    local_peer: PeerId,
    identity: Identity,
    manager: SocketManager,
    transport_config: Arc<TransportConfig>,
    token_store: Arc<MemoryTokenStore>,
    gater: Option<Arc<dyn ConnectionGater>>,
}

impl QuicTransport {
    /// Creates a transport from the node's long-term keypair.
    ///
    /// A non-empty pre-shared network key is rejected outright; gating, when
    /// wanted, is injected as a shared capability object.
    pub fn new(
        keypair: &Keypair,
        psk: Option<PreSharedKey>,
        gater: Option<Arc<dyn ConnectionGater>>,
        config: QuicConfig,
    ) -> Result<Self> {
        if psk.is_some() {
            return Err(TransportError::PrivateNetworkUnsupported);
        }

        let local_peer = keypair.public().to_peer_id();
        let identity = Identity::new(keypair)?;

        // Derive the stateless-reset key from the identity key, so restarts
        // on the same port can reset peers that kept connection state.
        let endpoint_config = match keypair.derive_secret(STATELESS_RESET_KEY_INFO) {
            Some(secret) => {
                let reset_key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, &secret);
                EndpointConfig::new(Arc::new(reset_key))
            }
            None => EndpointConfig::default(),
        };

        let manager = SocketManager::new(
            endpoint_config,
            gater.clone(),
            config.garbage_collect_interval,
            config.max_unused_duration,
        );

        info!("QUIC transport created for {}", local_peer);

        Ok(Self {
            keypair: keypair.clone(),
            local_peer,
            identity,
            manager,
            transport_config: config.build_transport_config(),
            token_store: Arc::new(MemoryTokenStore::new(config.token_store_capacity)),
            gater,
        })
    }

    /// Dials `remote_addr`, verifying that the responder controls
    /// `remote_peer`. Dropping the returned future aborts the handshake and
    /// releases the socket.
    pub async fn dial(&self, remote_addr: &Multiaddr, remote_peer: PeerId) -> Result<Connection> {
        let udp_addr = multiaddr_to_socketaddr(remote_addr)?;
        debug!("Dialing {} at {}", remote_peer, udp_addr);

        let (tls_config, remote_key) = self.identity.client_config(remote_peer)?;
        let crypto = QuicClientConfig::try_from(tls_config)
            .map_err(|e| TransportError::TlsConfig(e.to_string()))?;
        let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
        client_config.transport_config(self.transport_config.clone());
        client_config.token_store(self.token_store.clone());

        // The socket reference is dropped, and thereby released, on every
        // failure path below.
        let socket = self.manager.dial(udp_addr)?;
        let connecting =
            socket
                .endpoint()
                .connect_with(client_config, udp_addr, &udp_addr.ip().to_string())?;
        let session = connecting.await.map_err(from_handshake_error)?;

        let remote_public_key = remote_key
            .get()
            .cloned()
            .ok_or(TransportError::Internal(
                "expected remote public key to be set after the handshake",
            ))?;

        let local_addr = socket.endpoint().local_addr()?;
        let remote_multiaddr = crate::addr::socketaddr_to_multiaddr(&session.remote_address());

        debug!("Dial to {} succeeded", remote_peer);

        Ok(Connection::new(
            session,
            socket,
            self.keypair.clone(),
            self.local_peer,
            remote_peer,
            remote_public_key,
            local_addr,
            local_multiaddr(&local_addr),
            remote_multiaddr,
        ))
    }

    /// Starts listening on `addr` (`/ip{4,6}/<ip>/udp/<port>/quic`).
    pub fn listen(&self, addr: &Multiaddr) -> Result<Listener> {
        let udp_addr = multiaddr_to_socketaddr(addr)?;

        let tls_config = self.identity.server_config()?;
        let crypto = QuicServerConfig::try_from(tls_config)
            .map_err(|e| TransportError::TlsConfig(e.to_string()))?;
        let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
        server_config.transport_config(self.transport_config.clone());

        let socket = self.manager.listen(udp_addr, server_config)?;
        Listener::new(
            socket,
            self.keypair.clone(),
            self.local_peer,
            self.gater.clone(),
        )
    }

    /// Whether this transport can dial the address.
    pub fn can_dial(&self, addr: &Multiaddr) -> bool {
        is_quic_multiaddr(addr)
    }

    /// The protocol suffix this transport claims.
    pub fn protocols(&self) -> Vec<Protocol<'static>> {
        vec![Protocol::Quic]
    }

    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }
}
