use std::time::Duration;

/// Largest segment a virtual network device hands us, `(1 << 16) - 1`.
pub const MAX_SEGMENT_SIZE: usize = (1 << 16) - 1;

/// Environment variable consulted by [`UringConfig::from_env`].
pub const ENV_TOGGLE: &str = "RINGLINK_IO_URING";

const UDP_RECV_DEPTH: usize = 8;
const UDP_SEND_DEPTH: usize = 8;

// Tun devices do not tolerate more than one concurrent `preadv`.
const FILE_READ_DEPTH: usize = 1;
const FILE_WRITE_DEPTH: usize = 8;

/// Results shorter than this are rejected by `UringFile::read`.
const MIN_READ_LEN: usize = 4;

const TEARDOWN_TIMEOUT: Duration = Duration::from_millis(100);

const SQPOLL_IDLE: Duration = Duration::from_millis(10);

/// Resolved configuration threaded through connection construction.
///
/// Build it once at startup with [`Builder`] or [`UringConfig::from_env`] and
/// hand it to [`Uring::probe`](crate::Uring::probe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UringConfig {
    pub(crate) enabled: bool,
    pub(crate) udp_recv_depth: usize,
    pub(crate) udp_send_depth: usize,
    pub(crate) file_read_depth: usize,
    pub(crate) file_write_depth: usize,
    pub(crate) buffer_size: usize,
    pub(crate) min_read_len: usize,
    pub(crate) teardown_timeout: Duration,
    pub(crate) sqpoll_idle: Option<Duration>,
}

impl Default for UringConfig {
    fn default() -> Self {
        Builder::new().build()
    }
}

impl UringConfig {
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Default configuration with the io_uring toggle read from
    /// `RINGLINK_IO_URING`. Values `0`, `false`, `off` and `no` disable it.
    pub fn from_env() -> Self {
        let raw = std::env::var(ENV_TOGGLE).ok();
        Builder::new().enabled(parse_toggle(raw.as_deref())).build()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

fn parse_toggle(raw: Option<&str>) -> bool {
    match raw.map(|v| v.trim().to_ascii_lowercase()) {
        Some(v) => !matches!(v.as_str(), "0" | "false" | "off" | "no"),
        None => true,
    }
}

#[derive(Debug, Clone)]
pub struct Builder {
    cfg: UringConfig,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            cfg: UringConfig {
                enabled: true,
                udp_recv_depth: UDP_RECV_DEPTH,
                udp_send_depth: UDP_SEND_DEPTH,
                file_read_depth: FILE_READ_DEPTH,
                file_write_depth: FILE_WRITE_DEPTH,
                buffer_size: MAX_SEGMENT_SIZE,
                min_read_len: MIN_READ_LEN,
                teardown_timeout: TEARDOWN_TIMEOUT,
                sqpoll_idle: Some(SQPOLL_IDLE),
            },
        }
    }

    /// Turns io_uring on or off. A disabled config makes `Uring::probe` fail.
    pub fn enabled(&mut self, val: bool) -> &mut Self {
        self.cfg.enabled = val;
        self
    }

    /// Number of `recvmsg` requests kept in flight on a UDP connection.
    pub fn udp_recv_depth(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "udp_recv_depth cannot be set to 0");
        self.cfg.udp_recv_depth = val;
        self
    }

    /// Number of send slots on a UDP connection.
    pub fn udp_send_depth(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "udp_send_depth cannot be set to 0");
        self.cfg.udp_send_depth = val;
        self
    }

    pub fn file_read_depth(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "file_read_depth cannot be set to 0");
        self.cfg.file_read_depth = val;
        self
    }

    pub fn file_write_depth(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "file_write_depth cannot be set to 0");
        self.cfg.file_write_depth = val;
        self
    }

    /// Size of every slot buffer. Payloads larger than this are rejected.
    pub fn buffer_size(&mut self, val: usize) -> &mut Self {
        assert!(val > 0, "buffer_size cannot be set to 0");
        self.cfg.buffer_size = val;
        self
    }

    pub fn min_read_len(&mut self, val: usize) -> &mut Self {
        self.cfg.min_read_len = val;
        self
    }

    /// Upper bound on draining in-flight requests when a connection releases
    /// its rings.
    pub fn teardown_timeout(&mut self, val: Duration) -> &mut Self {
        self.cfg.teardown_timeout = val;
        self
    }

    /// Run each ring with a kernel submission thread that sleeps after `idle`
    /// without work. `None` submits from the calling thread instead, in which
    /// case requests still pending when that thread exits are cancelled by
    /// the kernel.
    pub fn sqpoll_idle(&mut self, idle: Option<Duration>) -> &mut Self {
        self.cfg.sqpoll_idle = idle;
        self
    }

    pub fn build(&self) -> UringConfig {
        self.cfg.clone()
    }
}
