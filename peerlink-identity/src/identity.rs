use std::sync::{Arc, OnceLock};

use libp2p_identity::{Keypair, PeerId, PublicKey};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use crate::certificate;
use crate::errors::{IdentityError, Result};
use crate::verifier::{AnyPeerVerifier, PeerVerifier};

/// ALPN protocol identifier fixed by the libp2p TLS specification.
const P2P_ALPN: &[u8] = b"libp2p";

/// A node's TLS identity: a self-signed certificate binding the TLS session
/// to the node's long-term libp2p key.
///
/// One `Identity` is created per transport and produces the rustls
/// configurations for every dial and listen. Dial configurations carry a
/// per-peer verifier; the server configuration accepts any client whose
/// certificate carries a valid identity binding.
///
/// # Example
///
/// ```rust
/// use libp2p_identity::Keypair;
/// use peerlink_identity::Identity;
///
/// let _ = rustls::crypto::ring::default_provider().install_default();
///
/// let keypair = Keypair::generate_ed25519();
/// let identity = Identity::new(&keypair).unwrap();
/// let (client_config, remote_key) =
///     identity.client_config(keypair.public().to_peer_id()).unwrap();
/// ```
pub struct Identity {
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
}

impl Identity {
    /// Generates the TLS identity for a node from its libp2p keypair.
    pub fn new(keypair: &Keypair) -> Result<Self> {
        let (cert, private_key) = certificate::generate(keypair)?;
        Ok(Self {
            cert_chain: vec![cert],
            private_key,
        })
    }

    /// Builds a client TLS configuration that only completes a handshake
    /// with the given peer.
    ///
    /// The returned slot is filled with the peer's public key by the
    /// verifier during the handshake; read it once the handshake is done,
    /// never before.
    pub fn client_config(
        &self,
        expected: PeerId,
    ) -> Result<(rustls::ClientConfig, Arc<OnceLock<PublicKey>>)> {
        let remote_key = Arc::new(OnceLock::new());
        let verifier = Arc::new(PeerVerifier::new(expected, remote_key.clone()));

        let mut config =
            rustls::ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
                .dangerous()
                .with_custom_certificate_verifier(verifier)
                .with_client_auth_cert(self.cert_chain.clone(), self.private_key.clone_key())
                .map_err(|e| IdentityError::TlsConfig(e.to_string()))?;
        config.alpn_protocols = vec![P2P_ALPN.to_vec()];

        Ok((config, remote_key))
    }

    /// Builds the server TLS configuration shared by all inbound handshakes.
    pub fn server_config(&self) -> Result<rustls::ServerConfig> {
        let mut config =
            rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
                .with_client_cert_verifier(Arc::new(AnyPeerVerifier))
                .with_single_cert(self.cert_chain.clone(), self.private_key.clone_key())
                .map_err(|e| IdentityError::TlsConfig(e.to_string()))?;
        config.alpn_protocols = vec![P2P_ALPN.to_vec()];

        Ok(config)
    }

    /// Derives the peer identity from a presented certificate chain.
    ///
    /// The chain was already verified during the handshake; this re-derives
    /// the identity for the accept path, which has no per-peer verifier.
    pub fn peer_from_chain(chain: &[CertificateDer<'_>]) -> Result<(PeerId, PublicKey)> {
        certificate::peer_from_chain(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_configs_build() {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let keypair = Keypair::generate_ed25519();
        let identity = Identity::new(&keypair).unwrap();

        let peer = keypair.public().to_peer_id();
        let (client, slot) = identity.client_config(peer).unwrap();
        assert_eq!(client.alpn_protocols, vec![b"libp2p".to_vec()]);
        assert!(slot.get().is_none());

        let server = identity.server_config().unwrap();
        assert_eq!(server.alpn_protocols, vec![b"libp2p".to_vec()]);
    }

    #[test]
    fn test_peer_from_chain_matches_keypair() {
        let keypair = Keypair::generate_ed25519();
        let identity = Identity::new(&keypair).unwrap();

        let (peer, key) = Identity::peer_from_chain(&identity.cert_chain).unwrap();
        assert_eq!(peer, keypair.public().to_peer_id());
        assert_eq!(key, keypair.public());
    }
}
