use crate::net::Family;
use io_uring::squeue::PushError;
use std::io::{self, Error, ErrorKind};
use std::net::SocketAddr;

/// A centralized error type for rings, request pools and connections.
#[derive(thiserror::Error, Debug)]
pub enum UringError {
    /// The kernel does not provide the required `io_uring` facilities, or the
    /// configuration turned them off.
    #[error("io_uring is unavailable: {reason}")]
    Unavailable { reason: &'static str },

    /// Allocating the kernel queues for a ring failed.
    #[error("io_uring initialization failed: {0}")]
    Init(#[source] io::Error),

    /// The submission queue ring is full. Nothing was queued.
    #[error("Submission queue ring is full, cannot submit IO")]
    SqRingFull(#[from] PushError),

    /// The entry was queued but `io_uring_enter` failed. The entry stays in
    /// the SQ and goes out with the next submission.
    #[error("io_uring_enter failed: {0}")]
    Submit(#[source] io::Error),

    /// The kernel completed the request with a negative result.
    #[error("request completed with error: {0}")]
    Completion(#[source] io::Error),

    #[error("connection is closed")]
    Closed,

    #[error("cannot send to {addr} on an {family} connection")]
    AddressFamily { addr: SocketAddr, family: Family },

    #[error("kernel returned a malformed socket address")]
    MalformedAddress,

    #[error("short read: got {0} bytes")]
    ShortRead(usize),

    #[error("payload of {len} bytes exceeds slot buffer of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("FATAL: completion carried slot index {index}, pool has {len} slots")]
    SlotOutOfRange { index: u64, len: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl UringError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, UringError::SlotOutOfRange { .. })
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            UringError::Init(e)
            | UringError::Submit(e)
            | UringError::Completion(e)
            | UringError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl From<UringError> for io::Error {
    fn from(e: UringError) -> Self {
        match e {
            UringError::Completion(e) | UringError::Io(e) => e,
            UringError::Unavailable { .. } => Error::new(ErrorKind::Unsupported, e.to_string()),
            UringError::Closed => Error::new(ErrorKind::NotConnected, e.to_string()),
            UringError::AddressFamily { .. } | UringError::PayloadTooLarge { .. } => {
                Error::new(ErrorKind::InvalidInput, e.to_string())
            }
            UringError::MalformedAddress | UringError::ShortRead(_) => {
                Error::new(ErrorKind::InvalidData, e.to_string())
            }
            UringError::SqRingFull(_) => Error::new(ErrorKind::WouldBlock, e.to_string()),
            _ => Error::other(e.to_string()),
        }
    }
}

/// Returned by every `set_*_timeout` on io_uring backed connections.
pub(crate) fn deadline_unsupported() -> io::Error {
    Error::new(
        ErrorKind::Unsupported,
        "deadlines are not supported on io_uring connections",
    )
}
