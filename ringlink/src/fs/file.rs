use crate::errors::{UringError, deadline_unsupported};
use crate::pool::{ReadKind, ReadPool, WriteKind, WritePool};
use crate::probe::Uring;
use crate::ring::Ring;
use parking_lot::RwLock;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

/// A packet oriented file descriptor, typically a tun device, driven through
/// io_uring `readv`/`writev` at the current file position.
///
/// Every read returns one whole packet, so a result shorter than the
/// configured minimum header length is rejected instead of being handed out.
pub struct UringFile {
    inner: RwLock<Option<Arc<FileInner>>>,
    min_read_len: usize,
}

// Pools drain before the file closes.
struct FileInner {
    read: ReadPool,
    write: WritePool,
    file: File,
}

impl UringFile {
    pub fn new(uring: &Uring, file: File) -> Result<Self, UringError> {
        let cfg = uring.config();
        let fd = file.as_raw_fd();

        let read = Ring::try_new(fd, cfg.file_read_depth, cfg.sqpoll_idle)?;
        let write = Ring::try_new(fd, cfg.file_write_depth, cfg.sqpoll_idle)?;

        let inner = FileInner {
            read: ReadPool::new(read, ReadKind::Readv, cfg.buffer_size, cfg.teardown_timeout),
            write: WritePool::new(write, cfg.buffer_size, cfg.teardown_timeout),
            file,
        };
        inner.read.subscribe()?;

        tracing::debug!(fd, "file connection opened");
        Ok(Self {
            inner: RwLock::new(Some(Arc::new(inner))),
            min_read_len: cfg.min_read_len,
        })
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, UringError> {
        let inner = self.inner()?;
        inner.read.complete(|slot, n| {
            if n < self.min_read_len {
                return Err(UringError::ShortRead(n));
            }
            Ok(slot.copy_out(n, buf))
        })
    }

    /// Queue `buf` as a single `writev` and return its length.
    ///
    /// Without a submission thread (see [`Builder::sqpoll_idle`]) a queued
    /// write is tied to the calling thread and dropped if it exits first.
    ///
    /// [`Builder::sqpoll_idle`]: crate::Builder::sqpoll_idle
    pub fn write(&self, buf: &[u8]) -> Result<usize, UringError> {
        let inner = self.inner()?;
        inner.write.submit(WriteKind::Writev, buf)?;
        Ok(buf.len())
    }

    /// Idempotent. Wakes blocked readers and writers with
    /// [`UringError::Closed`]; the file closes once the last of them returns.
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

    fn inner(&self) -> Result<Arc<FileInner>, UringError> {
        self.inner.read().clone().ok_or(UringError::Closed)
    }

    // Returns whether this call performed the teardown.
    fn teardown(&self) -> bool {
        let Some(inner) = self.inner.write().take() else {
            return false;
        };

        inner.read.shutdown();
        inner.write.shutdown();
        tracing::debug!(
            fd = inner.file.as_raw_fd(),
            read_inflight = inner.read.inflight(),
            write_free = inner.write.available(),
            "file connection closed"
        );
        true
    }

    #[cfg(test)]
    fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        self.inner().ok().map(|inner| inner.file.as_raw_fd())
    }

    #[cfg(test)]
    fn uses_sqpoll(&self) -> bool {
        self.inner().is_ok_and(|inner| inner.write.is_sqpoll())
    }

    #[cfg(test)]
    fn inflight_reads(&self) -> usize {
        self.inner().map_or(0, |inner| inner.read.inflight())
    }

    #[cfg(test)]
    fn free_write_slots(&self) -> usize {
        self.inner().map_or(0, |inner| inner.write.available())
    }
}

impl io::Read for &UringFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(UringFile::read(self, buf)?)
    }
}

impl io::Read for UringFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(UringFile::read(self, buf)?)
    }
}

impl io::Write for &UringFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(UringFile::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Write for UringFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(UringFile::write(self, buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for UringFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UringFile")
            .field("closed", &self.inner.read().is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use anyhow::Result;
    use static_assertions::assert_impl_all;
    use std::io::{Read, Write};
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    assert_impl_all!(UringFile: Send, Sync, io::Read, io::Write);

    #[test]
    fn test_pipe_round_trip() -> Result<()> {
        require_uring!();
        let uring = uring();
        let (rx, tx) = pipe()?;
        let reader = UringFile::new(&uring, rx)?;
        let writer = UringFile::new(&uring, tx)?;

        for i in 0..16u8 {
            let packet = payload(1500, i);
            assert_eq!(writer.write(&packet)?, 1500);

            let mut buf = vec![0u8; 2048];
            let n = reader.read(&mut buf)?;
            assert_eq!(&buf[..n], &packet[..]);
            assert_eq!(reader.inflight_reads(), 1);
        }
        Ok(())
    }

    #[test]
    fn test_short_read_is_rejected() -> Result<()> {
        require_uring!();
        let uring = uring();
        let (rx, mut tx) = pipe()?;
        let file = UringFile::new(&uring, rx)?;

        tx.write_all(&[0x45, 0x00])?;
        let mut buf = [0u8; 64];
        assert!(matches!(file.read(&mut buf), Err(UringError::ShortRead(2))));
        assert_eq!(file.inflight_reads(), 1);

        // The slot went back to the kernel, the next packet reads fine.
        tx.write_all(b"0123456789")?;
        assert_eq!(file.read(&mut buf)?, 10);
        assert_eq!(&buf[..10], b"0123456789");
        Ok(())
    }

    #[test]
    fn test_read_error_keeps_slot() -> Result<()> {
        require_uring!();
        let uring = uring();
        // Reading from the write end of a pipe fails with EBADF.
        let (_rx, tx) = pipe()?;
        let file = UringFile::new(&uring, tx)?;

        let mut buf = [0u8; 64];
        for _ in 0..2 {
            match file.read(&mut buf) {
                Err(UringError::Completion(e)) => assert_eq!(e.raw_os_error(), Some(libc::EBADF)),
                other => panic!("expected EBADF, got {:?}", other),
            }
            assert_eq!(file.inflight_reads(), 1);
        }
        Ok(())
    }

    // Every chunk of `sink` is one whole payload, and each seed shows up once.
    fn assert_payloads(sink: &[u8], count: u8) {
        let mut seen = vec![false; count as usize];
        for chunk in sink.chunks(1500) {
            let seed = chunk[0];
            assert!(seed < count, "unexpected payload seed {}", seed);
            assert_eq!(chunk, &payload(1500, seed)[..]);
            assert!(!seen[seed as usize], "payload {} written twice", seed);
            seen[seed as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_ninth_write_waits_for_reclaim() -> Result<()> {
        require_uring!();
        let uring = uring();
        let (mut rx, mut tx) = pipe()?;

        let capacity = set_pipe_capacity(&tx, 4096)?;
        tx.write_all(&vec![0u8; capacity])?;
        let file = UringFile::new(&uring, tx)?;
        assert_eq!(file.free_write_slots(), 8);

        let written = AtomicUsize::new(0);
        let drained = Barrier::new(2);
        thread::scope(|s| -> Result<()> {
            let writer = s.spawn(|| -> Result<(), UringError> {
                for i in 0..10u8 {
                    file.write(&payload(1500, i))?;
                    written.fetch_add(1, Ordering::AcqRel);
                }
                // Stay alive until every queued write has landed.
                drained.wait();
                Ok(())
            });

            // Eight writes are queued against a full pipe, the ninth has no
            // slot to go to.
            thread::sleep(Duration::from_millis(200));
            assert_eq!(written.load(Ordering::Acquire), 8);

            let mut sink = vec![0u8; capacity + 10 * 1500];
            rx.read_exact(&mut sink)?;
            drained.wait();

            writer.join().unwrap()?;
            assert_eq!(written.load(Ordering::Acquire), 10);
            assert!(sink[..capacity].iter().all(|b| *b == 0));
            assert_payloads(&sink[capacity..], 10);
            Ok(())
        })
    }

    #[test]
    fn test_writes_survive_writer_thread_exit() -> Result<()> {
        require_uring!();
        let uring = uring();
        let (mut rx, mut tx) = pipe()?;

        let capacity = set_pipe_capacity(&tx, 4096)?;
        tx.write_all(&vec![0u8; capacity])?;
        let file = UringFile::new(&uring, tx)?;
        if !file.uses_sqpoll() {
            eprintln!("skipping: no submission thread, queued writes follow their thread");
            return Ok(());
        }

        // All eight writes are parked on a full pipe when the thread exits.
        thread::scope(|s| {
            s.spawn(|| -> Result<(), UringError> {
                for i in 0..8u8 {
                    file.write(&payload(1500, i))?;
                }
                Ok(())
            })
            .join()
            .unwrap()
        })?;

        let mut sink = vec![0u8; capacity + 8 * 1500];
        rx.read_exact(&mut sink)?;
        assert_payloads(&sink[capacity..], 8);
        Ok(())
    }

    #[test]
    fn test_write_to_regular_file() -> Result<()> {
        require_uring!();
        let uring = uring();
        let tmp = tempfile::NamedTempFile::new()?;
        let file = UringFile::new(&uring, tmp.reopen()?)?;

        (&file).write_all(b"packet")?;
        (&file).flush()?;

        // Queued is not written, give the kernel a moment before closing.
        let mut contents = Vec::new();
        for _ in 0..100 {
            contents = std::fs::read(tmp.path())?;
            if !contents.is_empty() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        file.close()?;

        assert_eq!(contents, b"packet");
        Ok(())
    }

    #[test]
    fn test_close_is_idempotent() -> Result<()> {
        require_uring!();
        let uring = uring();
        let (rx, _tx) = pipe()?;
        let mut file = UringFile::new(&uring, rx)?;

        file.close()?;
        file.close()?;

        let mut buf = [0u8; 8];
        let err = Read::read(&mut file, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
        assert!(matches!(file.write(b"late"), Err(UringError::Closed)));
        assert_eq!(
            file.set_write_timeout(None).unwrap_err().kind(),
            io::ErrorKind::Unsupported
        );
        Ok(())
    }

    #[test]
    fn test_close_wakes_blocked_reader() -> Result<()> {
        require_uring!();
        let uring = uring();
        let (rx, _tx) = pipe()?;
        let file = UringFile::new(&uring, rx)?;

        thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut buf = [0u8; 64];
                file.read(&mut buf)
            });

            thread::sleep(Duration::from_millis(50));
            file.close().unwrap();
            assert!(matches!(reader.join().unwrap(), Err(UringError::Closed)));
        });
        Ok(())
    }

    #[test]
    fn test_concurrent_close_tears_down_once() -> Result<()> {
        require_uring!();
        let uring = uring();
        let (rx, mut tx) = pipe()?;
        let file = UringFile::new(&uring, rx)?;
        let fd = file.raw_fd().unwrap();
        let before = fd_identity(fd);
        assert!(before.is_some());
        let teardowns = AtomicUsize::new(0);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    if file.teardown() {
                        teardowns.fetch_add(1, Ordering::Relaxed);
                    }
                    file.close().unwrap();
                });
            }
        });

        assert_eq!(teardowns.load(Ordering::Relaxed), 1);
        assert_ne!(fd_identity(fd), before);
        assert!(file.raw_fd().is_none());

        // The read end is gone, so the pipe has no readers left.
        let err = tx.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        Ok(())
    }
}
