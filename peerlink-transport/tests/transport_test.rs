//! End-to-end tests for dialing, listening, gating, and socket reuse over
//! loopback.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use libp2p_identity::{Keypair, PeerId};
use multiaddr::Multiaddr;
use tokio::io::AsyncReadExt;
use tokio::time::timeout;

use peerlink_transport::{
    ConnectionGater, Direction, QuicConfig, QuicTransport, TransportError,
};

fn new_transport(gater: Option<Arc<dyn ConnectionGater>>) -> (QuicTransport, Keypair) {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let keypair = Keypair::generate_ed25519();
    let transport = QuicTransport::new(&keypair, None, gater, QuicConfig::default())
        .expect("transport construction");
    (transport, keypair)
}

struct TestGater {
    allow_accept: AtomicBool,
    allow_secured: AtomicBool,
    secured_calls: AtomicUsize,
}

impl TestGater {
    fn new(allow_accept: bool, allow_secured: bool) -> Arc<Self> {
        Arc::new(Self {
            allow_accept: AtomicBool::new(allow_accept),
            allow_secured: AtomicBool::new(allow_secured),
            secured_calls: AtomicUsize::new(0),
        })
    }
}

impl ConnectionGater for TestGater {
    fn intercept_accept(&self, _local: &Multiaddr, _remote: &Multiaddr) -> bool {
        self.allow_accept.load(Ordering::SeqCst)
    }

    fn intercept_secured(
        &self,
        _direction: Direction,
        _peer: &PeerId,
        _local: &Multiaddr,
        _remote: &Multiaddr,
    ) -> bool {
        self.secured_calls.fetch_add(1, Ordering::SeqCst);
        self.allow_secured.load(Ordering::SeqCst)
    }
}

async fn handshake_on(listen_addr: &str) {
    let (server, server_key) = new_transport(None);
    let (client, client_key) = new_transport(None);

    let listener = server.listen(&listen_addr.parse().unwrap()).unwrap();
    let dial_addr = listener.local_multiaddr().clone();
    let server_peer = server_key.public().to_peer_id();

    let accept = tokio::spawn(async move { listener.accept().await });

    let outbound = timeout(Duration::from_secs(5), client.dial(&dial_addr, server_peer))
        .await
        .expect("dial timed out")
        .expect("dial failed");
    let inbound = timeout(Duration::from_secs(5), accept)
        .await
        .expect("accept timed out")
        .unwrap()
        .expect("accept failed");

    // Both ends observe each other's identity.
    assert_eq!(outbound.remote_peer(), server_peer);
    assert_eq!(*outbound.remote_public_key(), server_key.public());
    assert_eq!(inbound.remote_peer(), client_key.public().to_peer_id());
    assert_eq!(*inbound.remote_public_key(), client_key.public());
    assert_eq!(outbound.local_peer(), client_key.public().to_peer_id());
    assert_eq!(inbound.local_peer(), server_peer);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_ipv4() {
    handshake_on("/ip4/127.0.0.1/udp/0/quic").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handshake_ipv6() {
    handshake_on("/ip6/::1/udp/0/quic").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dial_with_wrong_peer_id_fails() {
    let (server, _server_key) = new_transport(None);
    let (client, _client_key) = new_transport(None);
    let impostor = Keypair::generate_ed25519().public().to_peer_id();

    let listener = server.listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap()).unwrap();
    let dial_addr = listener.local_multiaddr().clone();

    let accept = tokio::spawn(async move {
        timeout(Duration::from_secs(1), listener.accept()).await
    });

    let err = timeout(Duration::from_secs(5), client.dial(&dial_addr, impostor))
        .await
        .expect("dial timed out")
        .expect_err("dial should have failed");
    assert!(
        matches!(err, TransportError::HandshakeFailed { .. }),
        "unexpected error: {err}"
    );
    assert!(err.is_crypto(), "expected a crypto handshake failure: {err}");

    // The listener never observes a successful session.
    assert!(accept.await.unwrap().is_err(), "accept should time out");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stream_round_trip_with_half_close() {
    let (server, server_key) = new_transport(None);
    let (client, _) = new_transport(None);

    let listener = server.listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap()).unwrap();
    let dial_addr = listener.local_multiaddr().clone();
    let server_peer = server_key.public().to_peer_id();

    let payload = vec![0x42u8; 5 * 1024 * 1024];
    let expected = payload.clone();

    let server_task = tokio::spawn(async move {
        let connection = listener.accept().await.expect("accept failed");
        let mut stream = connection.accept_stream().await.expect("accept_stream failed");

        let mut received = Vec::new();
        stream
            .read_to_end(&mut received)
            .await
            .expect("read_to_end failed");
        received
    });

    let connection = client.dial(&dial_addr, server_peer).await.expect("dial failed");
    let mut stream = connection.open_stream().await.expect("open_stream failed");
    stream.write_all(&payload).await.expect("write failed");
    stream.close_write().expect("close_write failed");

    let received = timeout(Duration::from_secs(10), server_task)
        .await
        .expect("transfer timed out")
        .unwrap();
    assert_eq!(received.len(), expected.len());
    assert_eq!(received, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_dials_to_two_servers() {
    let (client, _) = new_transport(None);
    let payload_len = 5 * 1024 * 1024;

    let mut dial_targets = Vec::new();
    for _ in 0..2 {
        let (server, server_key) = new_transport(None);
        let listener = server.listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap()).unwrap();
        let dial_addr = listener.local_multiaddr().clone();
        let server_peer = server_key.public().to_peer_id();

        tokio::spawn(async move {
            // Keep the transport alive for the duration of the test.
            let _server = server;
            let connection = listener.accept().await.expect("accept failed");
            let mut stream = connection.open_stream().await.expect("open_stream failed");
            stream
                .write_all(&vec![b'a'; payload_len])
                .await
                .expect("write failed");
            stream.close_write().expect("close_write failed");
            // Hold the connection open until the client has drained it.
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        dial_targets.push((dial_addr, server_peer));
    }

    let (first, second) = timeout(Duration::from_secs(5), async {
        tokio::join!(
            read_all_from(&client, dial_targets[0].0.clone(), dial_targets[0].1),
            read_all_from(&client, dial_targets[1].0.clone(), dial_targets[1].1),
        )
    })
    .await
    .expect("transfers timed out");

    assert_eq!(first.len(), payload_len);
    assert_eq!(second.len(), payload_len);
    assert!(first.iter().all(|&byte| byte == b'a'));
    assert!(second.iter().all(|&byte| byte == b'a'));
}

async fn read_all_from(client: &QuicTransport, addr: Multiaddr, peer: PeerId) -> Vec<u8> {
    let connection = client.dial(&addr, peer).await.expect("dial failed");
    let mut stream = connection.accept_stream().await.expect("accept_stream failed");
    let mut received = Vec::new();
    stream
        .read_to_end(&mut received)
        .await
        .expect("read_to_end failed");
    received
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gater_deny_then_allow() {
    let gater = TestGater::new(false, true);
    let (server, server_key) = new_transport(Some(gater.clone()));
    let (client, _) = new_transport(None);

    let listener = server.listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap()).unwrap();
    let dial_addr = listener.local_multiaddr().clone();
    let server_peer = server_key.public().to_peer_id();

    let accept = tokio::spawn(async move {
        let connection = listener.accept().await;
        connection
    });

    // All initial packets are dropped, so the dial sees only silence.
    let denied = timeout(Duration::from_secs(2), client.dial(&dial_addr, server_peer)).await;
    assert!(denied.is_err(), "gated dial should time out");

    gater.allow_accept.store(true, Ordering::SeqCst);

    let connection = timeout(Duration::from_secs(5), client.dial(&dial_addr, server_peer))
        .await
        .expect("dial timed out")
        .expect("dial after allow failed");
    assert_eq!(connection.remote_peer(), server_peer);

    let inbound = timeout(Duration::from_secs(5), accept)
        .await
        .expect("accept timed out")
        .unwrap()
        .expect("accept failed");
    assert_eq!(inbound.remote_peer(), client.local_peer());

    // The secured gate runs exactly once per accepted session.
    assert_eq!(gater.secured_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_gater_rejects_secured_session() {
    let gater = TestGater::new(true, false);
    let (server, server_key) = new_transport(Some(gater.clone()));
    let (client, _) = new_transport(None);

    let listener = server.listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap()).unwrap();
    let dial_addr = listener.local_multiaddr().clone();
    let server_peer = server_key.public().to_peer_id();

    let accept = tokio::spawn(async move {
        timeout(Duration::from_secs(2), listener.accept()).await
    });

    // The handshake itself completes; the rejection arrives afterwards.
    let connection = timeout(Duration::from_secs(5), client.dial(&dial_addr, server_peer))
        .await
        .expect("dial timed out")
        .expect("dial failed");

    let err = timeout(Duration::from_secs(5), connection.accept_stream())
        .await
        .expect("close was never observed")
        .expect_err("stream should fail on a gated connection");
    assert!(
        matches!(err, TransportError::Gated),
        "unexpected error: {err}"
    );

    // The gated session is skipped, not surfaced.
    assert!(accept.await.unwrap().is_err(), "accept should time out");
    assert_eq!(gater.secured_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dial_reuses_listening_socket() {
    let (server, server_key) = new_transport(None);
    let (client, client_key) = new_transport(None);

    // The client listens on a wildcard socket, then dials out. Both must
    // share the same local port.
    let client_listener = client.listen(&"/ip4/0.0.0.0/udp/0/quic".parse().unwrap()).unwrap();
    let client_port = client_listener.local_addr().unwrap().port();

    let server_listener = server.listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap()).unwrap();
    let dial_addr = server_listener.local_multiaddr().clone();
    let server_peer = server_key.public().to_peer_id();

    let accept = tokio::spawn(async move { server_listener.accept().await });

    let connection = timeout(Duration::from_secs(5), client.dial(&dial_addr, server_peer))
        .await
        .expect("dial timed out")
        .expect("dial failed");
    assert_eq!(connection.local_addr().port(), client_port);

    let inbound = timeout(Duration::from_secs(5), accept)
        .await
        .expect("accept timed out")
        .unwrap()
        .expect("accept failed");
    assert_eq!(inbound.remote_peer(), client_key.public().to_peer_id());
    assert_eq!(inbound.remote_addr().port(), client_port);

    // Closing the listener releases its reference; the connection keeps
    // the socket alive and usable.
    client_listener.close();
    let mut stream = connection.open_stream().await.expect("open_stream failed");
    stream.write_all(b"still alive").await.expect("write failed");
    stream.close_write().expect("close_write failed");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listener_close_makes_accept_fail() {
    let (server, _) = new_transport(None);
    let listener = server.listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap()).unwrap();

    listener.close();
    let err = timeout(Duration::from_secs(1), listener.accept())
        .await
        .expect("accept should return after close")
        .expect_err("accept should fail after close");
    assert!(matches!(err, TransportError::Closed));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_accepted_connection_keeps_socket_after_listener_close() {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let server_keypair = Keypair::generate_ed25519();
    let config = QuicConfig::new()
        .garbage_collect_interval(Duration::from_millis(50))
        .max_unused_duration(Duration::from_millis(20));
    let server = QuicTransport::new(&server_keypair, None, None, config).unwrap();
    let (client, _) = new_transport(None);

    let listener = server.listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap()).unwrap();
    let dial_addr = listener.local_multiaddr().clone();
    let port = listener.local_addr().unwrap().port();
    let server_peer = server_keypair.public().to_peer_id();

    let accept = tokio::spawn(async move {
        let connection = listener.accept().await.expect("accept failed");
        // The listener's own reference goes away immediately.
        listener.close();
        connection
    });

    let outbound = timeout(Duration::from_secs(5), client.dial(&dial_addr, server_peer))
        .await
        .expect("dial timed out")
        .expect("dial failed");
    let inbound = timeout(Duration::from_secs(5), accept)
        .await
        .expect("accept timed out")
        .unwrap();

    // Wait well past the reap window; the accepted connection's reference
    // must keep the socket open.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(std::net::UdpSocket::bind(("127.0.0.1", port)).is_err());

    let mut sent = outbound.open_stream().await.expect("open_stream failed");
    sent.write_all(b"ping").await.expect("write failed");
    sent.close_write().expect("close_write failed");

    let mut received = inbound.accept_stream().await.expect("accept_stream failed");
    let mut buf = Vec::new();
    received
        .read_to_end(&mut buf)
        .await
        .expect("read_to_end failed");
    assert_eq!(buf, b"ping");

    // Once the session ends the monitor releases the last reference and
    // the reaper reclaims the socket.
    inbound.close();
    outbound.close();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(std::net::UdpSocket::bind(("127.0.0.1", port)).is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_socket_reaped_after_listener_close() {
    let _ = rustls::crypto::ring::default_provider().install_default();
    let keypair = Keypair::generate_ed25519();
    let config = QuicConfig::new()
        .garbage_collect_interval(Duration::from_millis(50))
        .max_unused_duration(Duration::from_millis(20));
    let transport = QuicTransport::new(&keypair, None, None, config).unwrap();

    let listener = transport.listen(&"/ip4/127.0.0.1/udp/0/quic".parse().unwrap()).unwrap();
    let port = listener.local_addr().unwrap().port();

    // While the listener lives, its port is taken.
    assert!(std::net::UdpSocket::bind(("127.0.0.1", port)).is_err());

    drop(listener);
    tokio::time::sleep(Duration::from_millis(400)).await;

    // The reaper has closed the socket; the port is free again.
    assert!(std::net::UdpSocket::bind(("127.0.0.1", port)).is_ok());
}
