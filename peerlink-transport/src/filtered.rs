use std::fmt;
use std::io::{self, IoSliceMut};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use multiaddr::Multiaddr;
use quinn::udp::{RecvMeta, Transmit};
use quinn::{AsyncUdpSocket, UdpPoller};
use tracing::trace;

use crate::addr::socketaddr_to_multiaddr;
use crate::errors::Result;
use crate::gater::ConnectionGater;

/// UDP socket decorator that consults the gater before the QUIC engine sees
/// a packet from an unknown flow.
///
/// Long-header packets (first byte with the high bit set) open new flows and
/// are subject to `intercept_accept`; short-header packets belong to
/// established connections and pass through untouched. Rejected datagrams
/// are dropped and the read loop moves on to the next packet, so a gated
/// dialer observes nothing but a handshake timeout.
pub(crate) struct FilteredSocket {
    inner: Arc<dyn AsyncUdpSocket>,
    gater: Arc<dyn ConnectionGater>,
    local_multiaddr: Multiaddr,
}

impl FilteredSocket {
    pub(crate) fn new(
        inner: Arc<dyn AsyncUdpSocket>,
        gater: Arc<dyn ConnectionGater>,
    ) -> Result<Self> {
        let local_multiaddr = socketaddr_to_multiaddr(&inner.local_addr()?);
        Ok(Self {
            inner,
            gater,
            local_multiaddr,
        })
    }
}

impl fmt::Debug for FilteredSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilteredSocket")
            .field("inner", &self.inner)
            .field("local_multiaddr", &self.local_multiaddr)
            .finish()
    }
}

impl AsyncUdpSocket for FilteredSocket {
    fn create_io_poller(self: Arc<Self>) -> Pin<Box<dyn UdpPoller>> {
        self.inner.clone().create_io_poller()
    }

    fn try_send(&self, transmit: &Transmit) -> io::Result<()> {
        self.inner.try_send(transmit)
    }

    fn poll_recv(
        &self,
        cx: &mut Context,
        bufs: &mut [IoSliceMut<'_>],
        meta: &mut [RecvMeta],
    ) -> Poll<io::Result<usize>> {
        loop {
            let n = ready!(self.inner.poll_recv(cx, bufs, meta))?;

            let mut kept = 0;
            for i in 0..n {
                if self.admit(&bufs[i], &meta[i]) {
                    if kept != i {
                        meta.swap(kept, i);
                        let len = meta[kept].len;
                        let (head, tail) = bufs.split_at_mut(i);
                        head[kept][..len].copy_from_slice(&tail[0][..len]);
                    }
                    kept += 1;
                }
            }

            if kept > 0 {
                return Poll::Ready(Ok(kept));
            }
            // Every datagram in the batch was gated; read the next batch.
        }
    }

    fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.inner.local_addr()
    }

    fn may_fragment(&self) -> bool {
        self.inner.may_fragment()
    }

    fn max_transmit_segments(&self) -> usize {
        self.inner.max_transmit_segments()
    }

    fn max_receive_segments(&self) -> usize {
        self.inner.max_receive_segments()
    }
}

impl FilteredSocket {
    fn admit(&self, buf: &IoSliceMut<'_>, meta: &RecvMeta) -> bool {
        // Short-header packets belong to an existing connection.
        if meta.len < 1 || buf[0] & 0x80 == 0 {
            return true;
        }
        let remote = socketaddr_to_multiaddr(&meta.addr);
        let admit = self.gater.intercept_accept(&self.local_multiaddr, &remote);
        if !admit {
            trace!("Gater rejected packet from {}", meta.addr);
        }
        admit
    }
}
