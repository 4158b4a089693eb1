use crate::errors::{UringError, deadline_unsupported};
use crate::net::Family;
use crate::pool::{ReadKind, ReadPool, WriteKind, WritePool};
use crate::probe::Uring;
use crate::ring::Ring;
use parking_lot::RwLock;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

/// A UDP socket driven through a pair of io_uring instances, one for
/// `recvmsg` and one for `sendmsg`.
///
/// Receive keeps every recv slot in flight at all times. Send returns as soon
/// as the datagram is queued. One receiving thread and any number of sending
/// threads may share a connection.
pub struct UringUdpConn {
    inner: RwLock<Option<Arc<UdpInner>>>,
    local: SocketAddr,
    family: Family,
}

// Pools drain before the socket closes.
struct UdpInner {
    recv: ReadPool,
    send: WritePool,
    family: Family,
    socket: UdpSocket,
}

impl UringUdpConn {
    /// Takes ownership of a bound socket. The address family is fixed from
    /// its local address.
    pub fn new(uring: &Uring, socket: UdpSocket) -> Result<Self, UringError> {
        let cfg = uring.config();
        let local = socket.local_addr()?;
        let family = Family::of(&local);
        socket.set_nonblocking(false)?;

        let fd = socket.as_raw_fd();
        let recv = Ring::try_new(fd, cfg.udp_recv_depth, cfg.sqpoll_idle)?;
        // `recv` is released here if the second ring cannot be built.
        let send = Ring::try_new(fd, cfg.udp_send_depth, cfg.sqpoll_idle)?;

        let inner = UdpInner {
            recv: ReadPool::new(
                recv,
                ReadKind::RecvMsg(family),
                cfg.buffer_size,
                cfg.teardown_timeout,
            ),
            send: WritePool::new(send, cfg.buffer_size, cfg.teardown_timeout),
            family,
            socket,
        };
        inner.recv.subscribe()?;

        tracing::debug!(%local, %family, "udp connection opened");
        Ok(Self {
            inner: RwLock::new(Some(Arc::new(inner))),
            local,
            family,
        })
    }

    /// Receive one datagram into `buf`, truncating it if `buf` is too small.
    ///
    /// Returns the number of bytes copied and the sender's address.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), UringError> {
        let inner = self.inner()?;
        inner.recv.complete(|slot, n| {
            let source = slot.source(inner.family)?;
            Ok((slot.copy_out(n, buf), source))
        })
    }

    /// Queue `buf` for `dest` and return its length. The datagram may still
    /// be in flight when this returns.
    ///
    /// Queued datagrams are owned by the ring's submission thread. When the
    /// kernel refuses one (see [`Builder::sqpoll_idle`]) they belong to the
    /// calling thread instead, and are dropped if it exits before they
    /// complete.
    ///
    /// [`Builder::sqpoll_idle`]: crate::Builder::sqpoll_idle
    pub fn send_to(&self, buf: &[u8], dest: SocketAddr) -> Result<usize, UringError> {
        let dest = self.family.encodable(dest)?;
        let inner = self.inner()?;
        inner.send.submit(WriteKind::SendMsg(&dest), buf)?;
        Ok(buf.len())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Idempotent. Wakes any thread blocked in `recv_from` or `send_to`,
    /// which then fail with [`UringError::Closed`]. The socket is closed once
    /// the last of them returns.
    pub fn close(&self) -> io::Result<()> {
        self.teardown();
        Ok(())
    }

    pub fn set_read_timeout(&self, _dur: Option<Duration>) -> io::Result<()> {
        Err(deadline_unsupported())
    }

    pub fn set_write_timeout(&self, _dur: Option<Duration>) -> io::Result<()> {
        Err(deadline_unsupported())
    }

    fn inner(&self) -> Result<Arc<UdpInner>, UringError> {
        self.inner.read().clone().ok_or(UringError::Closed)
    }

    // Returns whether this call performed the teardown.
    fn teardown(&self) -> bool {
        let Some(inner) = self.inner.write().take() else {
            return false;
        };

        inner.recv.shutdown();
        inner.send.shutdown();
        tracing::debug!(
            local = %self.local,
            fd = inner.socket.as_raw_fd(),
            recv_inflight = inner.recv.inflight(),
            send_free = inner.send.available(),
            "udp connection closed"
        );
        true
    }

    #[cfg(test)]
    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        self.inner().ok().map(|inner| inner.socket.as_raw_fd())
    }

    #[cfg(test)]
    fn inflight_reads(&self) -> usize {
        self.inner().map_or(0, |inner| inner.recv.inflight())
    }
}

impl std::fmt::Debug for UringUdpConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UringUdpConn")
            .field("local", &self.local)
            .field("closed", &self.inner.read().is_none())
            .finish()
    }
}
