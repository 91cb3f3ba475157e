use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use quinn::{AsyncUdpSocket, Endpoint, EndpointConfig, Runtime, ServerConfig, TokioRuntime};
use tracing::{debug, warn};

use crate::errors::Result;
use crate::filtered::FilteredSocket;
use crate::gater::ConnectionGater;

/// A UDP socket (wrapped in a QUIC endpoint) shared between a listener and
/// any number of outbound dials.
///
/// The registry keeps the socket alive while anything references it. When
/// the reference count drops to zero the socket is stamped and becomes a
/// candidate for the reaper; acquiring a new reference clears the stamp.
pub(crate) struct SharedSocket {
    endpoint: Endpoint,
    state: Mutex<RefState>,
}

struct RefState {
    ref_count: usize,
    unused_since: Option<Instant>,
}

impl SharedSocket {
    fn new(endpoint: Endpoint) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            state: Mutex::new(RefState {
                ref_count: 0,
                unused_since: None,
            }),
        })
    }

    fn acquire(self: &Arc<Self>) -> SocketRef {
        let mut state = self.state.lock().unwrap();
        state.ref_count += 1;
        state.unused_since = None;
        drop(state);
        SocketRef {
            socket: Arc::clone(self),
        }
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap();
        match state.ref_count.checked_sub(1) {
            Some(count) => state.ref_count = count,
            None => {
                warn!("Socket reference released more often than acquired");
                return;
            }
        }
        if state.ref_count == 0 {
            state.unused_since = Some(Instant::now());
        }
    }

    fn should_reap(&self, now: Instant, max_unused: Duration) -> bool {
        let state = self.state.lock().unwrap();
        state.ref_count == 0
            && state
                .unused_since
                .is_some_and(|since| since + max_unused < now)
    }

    fn close(&self) {
        self.endpoint.close(0u32.into(), b"");
    }

    #[cfg(test)]
    fn ref_count(&self) -> usize {
        self.state.lock().unwrap().ref_count
    }
}

/// A borrowed reference to a [`SharedSocket`]; dropping it releases the
/// reference, so every acquisition is paired with exactly one release no
/// matter which path an operation takes out of the dial or listen flow.
pub(crate) struct SocketRef {
    socket: Arc<SharedSocket>,
}

impl SocketRef {
    pub(crate) fn endpoint(&self) -> &Endpoint {
        &self.socket.endpoint
    }

    /// Takes an additional reference to the same socket.
    pub(crate) fn share(&self) -> SocketRef {
        self.socket.acquire()
    }
}

impl Drop for SocketRef {
    fn drop(&mut self) {
        self.socket.release();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    V4,
    V6,
}

impl Family {
    fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    fn wildcard(self) -> SocketAddr {
        match self {
            Family::V4 => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            Family::V6 => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        }
    }
}

#[derive(Default)]
struct PoolInner {
    /// Sockets bound to a concrete IP, keyed by IP then port.
    unicast: HashMap<IpAddr, HashMap<u16, Arc<SharedSocket>>>,
    /// Sockets bound to the unspecified address, keyed by port. These can
    /// receive replies addressed to any local IP, so they are preferred for
    /// dialing over opening yet another ephemeral socket.
    global: HashMap<u16, Arc<SharedSocket>>,
    reaper_running: bool,
}

/// Per-family socket registry.
pub(crate) struct SocketPool {
    family: Family,
    endpoint_config: EndpointConfig,
    gater: Option<Arc<dyn ConnectionGater>>,
    garbage_collect_interval: Duration,
    max_unused_duration: Duration,
    inner: Arc<Mutex<PoolInner>>,
}

impl SocketPool {
    fn new(
        family: Family,
        endpoint_config: EndpointConfig,
        gater: Option<Arc<dyn ConnectionGater>>,
        garbage_collect_interval: Duration,
        max_unused_duration: Duration,
    ) -> Self {
        Self {
            family,
            endpoint_config,
            gater,
            garbage_collect_interval,
            max_unused_duration,
            inner: Arc::new(Mutex::new(PoolInner::default())),
        }
    }

    /// Binds a fresh socket for a listener and registers it.
    pub(crate) fn listen(
        &self,
        bind_addr: SocketAddr,
        server_config: ServerConfig,
    ) -> Result<SocketRef> {
        let endpoint = self.create_endpoint(bind_addr, Some(server_config))?;
        let local_addr = endpoint.local_addr()?;
        let socket = SharedSocket::new(endpoint);
        let socket_ref = socket.acquire();

        let mut inner = self.inner.lock().unwrap();
        if local_addr.ip().is_unspecified() {
            inner.global.insert(local_addr.port(), socket);
        } else {
            inner
                .unicast
                .entry(local_addr.ip())
                .or_default()
                .insert(local_addr.port(), socket);
        }
        self.maybe_start_reaper(&mut inner);

        debug!("Listening socket bound on {}", local_addr);
        Ok(socket_ref)
    }

    /// Picks a socket suitable for dialing `remote_addr`, opening a fresh
    /// wildcard-bound one only when nothing can be reused.
    pub(crate) fn dial(&self, remote_addr: SocketAddr) -> Result<SocketRef> {
        let source_ips = preferred_source_ips(&remote_addr);

        let mut inner = self.inner.lock().unwrap();
        if let Some(socket) = Self::select_reusable(&inner, &source_ips) {
            let socket_ref = socket.acquire();
            self.maybe_start_reaper(&mut inner);
            return Ok(socket_ref);
        }

        let endpoint = self.create_endpoint(self.family.wildcard(), None)?;
        let port = endpoint.local_addr()?.port();
        let socket = SharedSocket::new(endpoint);
        let socket_ref = socket.acquire();
        inner.global.insert(port, socket);
        self.maybe_start_reaper(&mut inner);

        debug!("Opened ephemeral dialing socket on port {}", port);
        Ok(socket_ref)
    }

    fn select_reusable(inner: &PoolInner, source_ips: &[IpAddr]) -> Option<Arc<SharedSocket>> {
        for ip in source_ips {
            if let Some(sockets) = inner.unicast.get(ip) {
                // Any port on the right source IP will do.
                if let Some(socket) = sockets.values().next() {
                    return Some(Arc::clone(socket));
                }
            }
        }
        inner.global.values().next().map(Arc::clone)
    }

    fn create_endpoint(
        &self,
        bind_addr: SocketAddr,
        server_config: Option<ServerConfig>,
    ) -> Result<Endpoint> {
        let socket = std::net::UdpSocket::bind(bind_addr)?;
        let runtime = Arc::new(TokioRuntime);
        let udp = runtime.wrap_udp_socket(socket)?;
        let udp: Arc<dyn AsyncUdpSocket> = match &self.gater {
            Some(gater) => Arc::new(FilteredSocket::new(udp, Arc::clone(gater))?),
            None => udp,
        };
        Ok(Endpoint::new_with_abstract_socket(
            self.endpoint_config.clone(),
            server_config,
            udp,
            runtime,
        )?)
    }

    // Must be called while holding the registry mutex.
    fn maybe_start_reaper(&self, inner: &mut PoolInner) {
        if inner.reaper_running {
            return;
        }
        inner.reaper_running = true;
        tokio::spawn(reap_loop(
            Arc::clone(&self.inner),
            self.garbage_collect_interval,
            self.max_unused_duration,
        ));
    }

    #[cfg(test)]
    fn tracked_sockets(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.global.len() + inner.unicast.values().map(HashMap::len).sum::<usize>()
    }

    #[cfg(test)]
    fn reaper_running(&self) -> bool {
        self.inner.lock().unwrap().reaper_running
    }
}

async fn reap_loop(pool: Arc<Mutex<PoolInner>>, interval: Duration, max_unused: Duration) {
    loop {
        tokio::time::sleep(interval).await;

        let mut condemned: Vec<Arc<SharedSocket>> = Vec::new();
        let should_exit;
        {
            let mut inner = pool.lock().unwrap();
            let now = Instant::now();
            inner.global.retain(|_, socket| {
                if socket.should_reap(now, max_unused) {
                    condemned.push(Arc::clone(socket));
                    false
                } else {
                    true
                }
            });
            inner.unicast.retain(|_, sockets| {
                sockets.retain(|_, socket| {
                    if socket.should_reap(now, max_unused) {
                        condemned.push(Arc::clone(socket));
                        false
                    } else {
                        true
                    }
                });
                !sockets.is_empty()
            });

            // With nothing left to track there is no work until the next
            // listen or dial restarts the reaper.
            should_exit = inner.global.is_empty() && inner.unicast.is_empty();
            if should_exit {
                inner.reaper_running = false;
            }
        }

        // Closing is done outside the critical section.
        for socket in condemned {
            debug!("Reaping idle socket");
            socket.close();
        }
        if should_exit {
            return;
        }
    }
}

/// Asks the routing table which source IP the kernel would pick for this
/// destination. Connecting a UDP socket sends no packets; it only fixes the
/// route and reveals the chosen local address.
fn preferred_source_ips(remote_addr: &SocketAddr) -> Vec<IpAddr> {
    let probe = || -> io::Result<IpAddr> {
        let socket = std::net::UdpSocket::bind(Family::of(remote_addr).wildcard())?;
        socket.connect(remote_addr)?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(ip) if !ip.is_unspecified() => vec![ip],
        // No route or no routing information; fall through to the global map.
        _ => Vec::new(),
    }
}

/// Dispatches listen and dial requests to the registry of the matching
/// address family.
pub(crate) struct SocketManager {
    v4: SocketPool,
    v6: SocketPool,
}

impl SocketManager {
    pub(crate) fn new(
        endpoint_config: EndpointConfig,
        gater: Option<Arc<dyn ConnectionGater>>,
        garbage_collect_interval: Duration,
        max_unused_duration: Duration,
    ) -> Self {
        Self {
            v4: SocketPool::new(
                Family::V4,
                endpoint_config.clone(),
                gater.clone(),
                garbage_collect_interval,
                max_unused_duration,
            ),
            v6: SocketPool::new(
                Family::V6,
                endpoint_config,
                gater,
                garbage_collect_interval,
                max_unused_duration,
            ),
        }
    }

    pub(crate) fn dial(&self, remote_addr: SocketAddr) -> Result<SocketRef> {
        self.pool_for(&remote_addr).dial(remote_addr)
    }

    pub(crate) fn listen(
        &self,
        bind_addr: SocketAddr,
        server_config: ServerConfig,
    ) -> Result<SocketRef> {
        self.pool_for(&bind_addr).listen(bind_addr, server_config)
    }

    fn pool_for(&self, addr: &SocketAddr) -> &SocketPool {
        match Family::of(addr) {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        }
    }
}
