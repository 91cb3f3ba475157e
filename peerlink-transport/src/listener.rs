use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use libp2p_identity::{Keypair, PeerId};
use multiaddr::Multiaddr;
use peerlink_identity::Identity;
use quinn::Endpoint;
use rustls::pki_types::CertificateDer;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::addr::{local_multiaddr, socketaddr_to_multiaddr};
use crate::connection::Connection;
use crate::errors::{Result, TransportError, CLOSE_CODE_GATED};
use crate::gater::{ConnectionGater, Direction};
use crate::reuse::SocketRef;

/// Listens for inbound QUIC connections on a registered socket.
pub struct Listener {
    endpoint: Endpoint,
    socket: Mutex<Option<SocketRef>>,
    closed: AtomicBool,
    closed_tx: watch::Sender<bool>,
    keypair: Keypair,
    local_peer: PeerId,
    local_multiaddr: Multiaddr,
    gater: Option<Arc<dyn ConnectionGater>>,
}

impl Listener {
    pub(crate) fn new(
        socket: SocketRef,
        keypair: Keypair,
        local_peer: PeerId,
        gater: Option<Arc<dyn ConnectionGater>>,
    ) -> Result<Self> {
        let endpoint = socket.endpoint().clone();
        let local_multiaddr = socketaddr_to_multiaddr(&endpoint.local_addr()?);
        let (closed_tx, _) = watch::channel(false);

        info!("QUIC listener started on {}", local_multiaddr);

        Ok(Self {
            endpoint,
            socket: Mutex::new(Some(socket)),
            closed: AtomicBool::new(false),
            closed_tx,
            keypair,
            local_peer,
            local_multiaddr,
            gater,
        })
    }

    /// Waits for the next admitted connection.
    ///
    /// Sessions that fail identity derivation or are rejected by the gater
    /// are closed and skipped; the loop only ends when the listener is
    /// closed.
    pub async fn accept(&self) -> Result<Connection> {
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closed);
            }

            let mut closed_rx = self.closed_tx.subscribe();
            let incoming = tokio::select! {
                _ = closed_rx.wait_for(|closed| *closed) => return Err(TransportError::Closed),
                incoming = self.endpoint.accept() => incoming.ok_or(TransportError::Closed)?,
            };

            let remote_addr = incoming.remote_address();
            let session = match incoming.await {
                Ok(session) => session,
                Err(e) => {
                    debug!("Inbound handshake from {} failed: {}", remote_addr, e);
                    continue;
                }
            };

            match self.setup_connection(session) {
                Ok(connection) => return Ok(connection),
                Err(e) => {
                    warn!("Rejected inbound session from {}: {}", remote_addr, e);
                    continue;
                }
            }
        }
    }

    fn setup_connection(&self, session: quinn::Connection) -> Result<Connection> {
        // The handshake already verified the chain; re-derive the identity
        // because the shared server config has no per-session key slot.
        let chain = session
            .peer_identity()
            .and_then(|identity| identity.downcast::<Vec<CertificateDer<'static>>>().ok())
            .ok_or(TransportError::Internal(
                "expected a verified peer certificate chain",
            ))?;
        let (remote_peer, remote_public_key) = Identity::peer_from_chain(&chain)?;

        let remote_multiaddr = socketaddr_to_multiaddr(&session.remote_address());
        let local_addr = self.endpoint.local_addr()?;

        if let Some(gater) = &self.gater {
            if !gater.intercept_secured(
                Direction::Inbound,
                &remote_peer,
                &self.local_multiaddr,
                &remote_multiaddr,
            ) {
                session.close(CLOSE_CODE_GATED.into(), b"connection gated");
                return Err(TransportError::Gated);
            }
        }

        // The accepted connection takes its own socket reference, so the
        // socket survives the listener closing first.
        let socket = self
            .socket
            .lock()
            .unwrap()
            .as_ref()
            .map(|socket| socket.share())
            .ok_or(TransportError::Closed)?;

        debug!("Accepted connection from {}", remote_peer);

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

    /// Stops accepting. The socket reference is released; the socket itself
    /// stays open while dialed connections still share it.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.endpoint.set_server_config(None);
        let _ = self.closed_tx.send(true);
        drop(self.socket.lock().unwrap().take());
        info!("QUIC listener on {} closed", self.local_multiaddr);
    }

    /// The bound multiaddress. Unspecified hosts are reported as such.
    pub fn local_multiaddr(&self) -> &Multiaddr {
        &self.local_multiaddr
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.endpoint.local_addr()?)
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}
