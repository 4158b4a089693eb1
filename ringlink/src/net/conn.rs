use crate::net::UringUdpConn;
use crate::probe::Uring;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Datagram capability shared by io_uring backed and plain sockets, so
/// callers can pick either at runtime.
pub trait PacketConn: Send + Sync {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Stop the connection. Blocked receivers return and further operations
    /// fail. Calling it again is a no-op.
    fn close(&self) -> io::Result<()>;

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()>;

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()>;
}

impl PacketConn for UringUdpConn {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        Ok(UringUdpConn::recv_from(self, buf)?)
    }

    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        Ok(UringUdpConn::send_to(self, buf, dest)?)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(UringUdpConn::local_addr(self))
    }

    fn close(&self) -> io::Result<()> {
        UringUdpConn::close(self)
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        UringUdpConn::set_read_timeout(self, dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        UringUdpConn::set_write_timeout(self, dur)
    }
}

impl PacketConn for UdpSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn send_to(&self, buf: &[u8], dest: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, dest)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }

    // The descriptor itself is closed on drop. Shutting the socket down wakes
    // blocked receivers, Linux reports ENOTCONN for unconnected UDP sockets
    // but still does it.
    fn close(&self) -> io::Result<()> {
        let ret = unsafe { libc::shutdown(self.as_raw_fd(), libc::SHUT_RDWR) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_read_timeout(self, dur)
    }

    fn set_write_timeout(&self, dur: Option<Duration>) -> io::Result<()> {
        UdpSocket::set_write_timeout(self, dur)
    }
}

/// Wrap a bound socket in the fastest available [`PacketConn`].
///
/// Uses io_uring when `uring` is given and the connection can be built,
/// otherwise falls back to the plain socket.
pub fn packet_conn(uring: Option<&Uring>, socket: UdpSocket) -> io::Result<Box<dyn PacketConn>> {
    let Some(uring) = uring else {
        return Ok(Box::new(socket));
    };

    // The connection takes the socket even when it fails to build.
    let fallback = socket.try_clone()?;
    match UringUdpConn::new(uring, socket) {
        Ok(conn) => Ok(Box::new(conn)),
        Err(e) => {
            tracing::warn!(error = %e, "io_uring connection failed, using plain socket");
            Ok(Box::new(fallback))
        }
    }
}
