//! Boundary between `std::net` addresses and the raw `sockaddr_in` /
//! `sockaddr_in6` structures the kernel reads and writes inside a slot.
use crate::errors::UringError;
use std::fmt;
use std::mem::size_of;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Address family of a connection, fixed at construction from its local
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    pub(crate) fn socklen(self) -> libc::socklen_t {
        match self {
            Family::V4 => size_of::<libc::sockaddr_in>() as libc::socklen_t,
            Family::V6 => size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        }
    }

    fn raw(self) -> libc::c_int {
        match self {
            Family::V4 => libc::AF_INET,
            Family::V6 => libc::AF_INET6,
        }
    }

    /// Rewrites `addr` into a form a socket of this family can send to.
    ///
    /// IPv4 sockets cannot reach IPv6 peers. IPv6 sockets reach IPv4 peers
    /// through IPv4-mapped addresses.
    pub(crate) fn encodable(self, addr: SocketAddr) -> Result<SocketAddr, UringError> {
        match (self, addr) {
            (Family::V4, SocketAddr::V4(_)) | (Family::V6, SocketAddr::V6(_)) => Ok(addr),
            (Family::V6, SocketAddr::V4(a)) => Ok(SocketAddr::V6(SocketAddrV6::new(
                a.ip().to_ipv6_mapped(),
                a.port(),
                0,
                0,
            ))),
            (Family::V4, SocketAddr::V6(_)) => Err(UringError::AddressFamily { addr, family: self }),
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("IPv4"),
            Family::V6 => f.write_str("IPv6"),
        }
    }
}

/// Scratch socket address owned by a slot. Sized for either family so a slot
/// never needs to be reallocated.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) union SockAddrScratch {
    v4: libc::sockaddr_in,
    v6: libc::sockaddr_in6,
}

impl SockAddrScratch {
    pub(crate) fn zeroed() -> Self {
        // SAFETY: both variants are plain C structs for which all-zero is valid.
        unsafe { std::mem::zeroed() }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::c_void {
        std::ptr::from_mut(self).cast()
    }

    /// Writes `addr` into the scratch space and returns the length to hand
    /// the kernel.
    pub(crate) fn encode(&mut self, addr: &SocketAddr) -> libc::socklen_t {
        match addr {
            SocketAddr::V4(a) => {
                self.v4 = socket_addr_v4_to_c(a);
                Family::V4.socklen()
            }
            SocketAddr::V6(a) => {
                self.v6 = socket_addr_v6_to_c(a);
                Family::V6.socklen()
            }
        }
    }

    /// Reads back the address the kernel stored for a received datagram.
    ///
    /// Decoding is driven by the connection family. A length or family tag
    /// that does not match is reported as malformed instead of being trusted.
    pub(crate) fn decode(
        &self,
        family: Family,
        len: libc::socklen_t,
    ) -> Result<SocketAddr, UringError> {
        // SAFETY: `sin_family` and `sin6_family` share the same offset and type.
        let tag = unsafe { self.v4.sin_family } as libc::c_int;
        if len < family.socklen() || tag != family.raw() {
            return Err(UringError::MalformedAddress);
        }

        // SAFETY: the tag and length were validated against `family` above.
        let addr = match family {
            Family::V4 => SocketAddr::V4(socket_addr_v4_from_c(unsafe { self.v4 })),
            Family::V6 => SocketAddr::V6(socket_addr_v6_from_c(unsafe { self.v6 })),
        };

        Ok(addr)
    }
}

impl fmt::Debug for SockAddrScratch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = unsafe { self.v4.sin_family };
        f.debug_struct("SockAddrScratch")
            .field("family", &tag)
            .finish()
    }
}

fn socket_addr_v4_to_c(addr: &SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: ip_v4_addr_to_c(addr.ip()),
        ..unsafe { std::mem::zeroed() }
    }
}

fn socket_addr_v6_to_c(addr: &SocketAddrV6) -> libc::sockaddr_in6 {
    libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: addr.port().to_be(),
        sin6_addr: libc::in6_addr {
            s6_addr: addr.ip().octets(),
        },
        sin6_flowinfo: addr.flowinfo(),
        sin6_scope_id: addr.scope_id(),
    }
}

fn socket_addr_v4_from_c(addr: libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(addr.sin_addr.s_addr.to_ne_bytes()),
        u16::from_be(addr.sin_port),
    )
}

fn socket_addr_v6_from_c(addr: libc::sockaddr_in6) -> SocketAddrV6 {
    SocketAddrV6::new(
        Ipv6Addr::from(addr.sin6_addr.s6_addr),
        u16::from_be(addr.sin6_port),
        addr.sin6_flowinfo,
        addr.sin6_scope_id,
    )
}

fn ip_v4_addr_to_c(addr: &Ipv4Addr) -> libc::in_addr {
    // `s_addr` is big endian and so are the octets, never swap.
    libc::in_addr {
        s_addr: u32::from_ne_bytes(addr.octets()),
    }
}
