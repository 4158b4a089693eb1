//! io_uring backed UDP sockets and packet devices for userspace packet
//! forwarding.
//!
//! Each connection keeps a fixed pool of kernel requests per direction, so
//! the hot path neither allocates nor issues a syscall per packet beyond the
//! completion wait. Construction requires a [`Uring`] obtained from a
//! successful probe.

pub mod config;
pub use config::{Builder, MAX_SEGMENT_SIZE, UringConfig};

pub mod errors;
pub use errors::UringError;

mod probe;
pub use probe::{Uring, is_available};

mod ring;

mod pool;

pub mod net;
pub use net::{Family, PacketConn, UringUdpConn, packet_conn};

pub mod fs;
pub use fs::UringFile;

mod utils;

#[cfg(test)]
mod test_utils;
