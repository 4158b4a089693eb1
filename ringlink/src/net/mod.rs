pub(crate) mod sockaddr;
pub use sockaddr::Family;

mod udp;
pub use udp::UringUdpConn;

mod conn;
pub use conn::{PacketConn, packet_conn};
