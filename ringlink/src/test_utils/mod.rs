use crate::{Uring, UringConfig};
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::OnceLock;

/// Returns early from a test when the kernel (or a seccomp profile) does not
/// let us create rings.
macro_rules! require_uring {
    () => {
        if !$crate::test_utils::uring_available() {
            eprintln!("skipping: io_uring is unavailable on this host");
            return Ok(());
        }
    };
}
pub(crate) use require_uring;

pub(crate) fn uring_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| crate::is_available(&UringConfig::default()))
}

pub(crate) fn uring() -> Uring {
    uring_with(UringConfig::default())
}

pub(crate) fn uring_with(cfg: UringConfig) -> Uring {
    match Uring::probe(cfg) {
        Ok(uring) => uring,
        Err(e) => panic!("probe failed after availability check: {:?}", e),
    }
}

pub(crate) fn devnull() -> io::Result<File> {
    File::options().read(true).write(true).open("/dev/null")
}

/// Blocking pipe as `(read end, write end)`.
pub(crate) fn pipe() -> io::Result<(File, File)> {
    let (rx, tx) = nix::unistd::pipe()?;
    Ok((File::from(rx), File::from(tx)))
}

/// Shrinks the pipe buffer and returns the capacity the kernel settled on.
pub(crate) fn set_pipe_capacity(pipe: &File, size: usize) -> io::Result<usize> {
    let ret = unsafe { libc::fcntl(pipe.as_raw_fd(), libc::F_SETPIPE_SZ, size as libc::c_int) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

/// Device and inode behind `fd`, or `None` once it is closed. A descriptor
/// number can be reused, the identity of what it points at cannot.
pub(crate) fn fd_identity(fd: RawFd) -> Option<(u64, u64)> {
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut st) } < 0 {
        return None;
    }
    Some((st.st_dev as u64, st.st_ino as u64))
}

pub(crate) fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}
