//! Request pools pairing a [`Ring`] with the slots it submits.
//!
//! Read pools are always fully subscribed: every slot is in flight except
//! while a reader copies one out, and it is resubmitted right after. Write
//! pools hand slots out through a free-list and reclaim them from the
//! completion queue.
use crate::errors::UringError;
use crate::net::Family;
use crate::ring::{Reaped, Ring};
use crate::utils::ScopeGuard;
use crossbeam_queue::ArrayQueue;
use std::mem::ManuallyDrop;
use std::net::SocketAddr;
use std::time::Duration;

mod slot;
pub(crate) use slot::{Slot, SlotArena};

#[derive(Debug, Clone, Copy)]
pub(crate) enum ReadKind {
    RecvMsg(Family),
    Readv,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum WriteKind<'a> {
    SendMsg(&'a SocketAddr),
    Writev,
}

pub(crate) struct ReadPool {
    ring: Ring,
    slots: ManuallyDrop<SlotArena>,
    kind: ReadKind,
    teardown_timeout: Duration,
}

impl ReadPool {
    pub(crate) fn new(
        ring: Ring,
        kind: ReadKind,
        buf_size: usize,
        teardown_timeout: Duration,
    ) -> Self {
        let slots = SlotArena::new(ring.depth(), buf_size);
        Self {
            ring,
            slots: ManuallyDrop::new(slots),
            kind,
            teardown_timeout,
        }
    }

    /// Put every slot in flight. Called once, right after construction.
    pub(crate) fn subscribe(&self) -> Result<(), UringError> {
        (0..self.slots.len()).try_for_each(|idx| self.submit(idx))
    }

    /// Wait for the next read to complete and hand its slot and byte count to
    /// `f`. The slot is resubmitted whatever the outcome, so an error never
    /// shrinks the pool.
    pub(crate) fn complete<T, F>(&self, f: F) -> Result<T, UringError>
    where
        F: FnOnce(&Slot, usize) -> Result<T, UringError>,
    {
        let (idx, completion) = loop {
            let completion = match self.ring.wait()? {
                Reaped::Slot(c) => c,
                Reaped::Wakeup if self.ring.is_closing() => return Err(UringError::Closed),
                Reaped::Wakeup => continue,
            };

            let idx = self.slots.index(completion.user_data())?;

            // Leave the slot idle, the drain on release accounts for it.
            if self.ring.is_closing() {
                return Err(UringError::Closed);
            }

            // Not closing, so the submitting thread exited and took the request
            // with it. Nothing was read.
            if completion.is_cancelled() {
                tracing::debug!(idx, "read cancelled by the kernel, resubmitting");
                self.submit(idx)?;
                continue;
            }

            break (idx, completion);
        };

        // SAFETY: the slot was just reaped, it is ours until resubmitted.
        let slot = unsafe { self.slots.get_mut(idx) };
        let out = completion
            .bytes()
            .map_err(UringError::Completion)
            .and_then(|n| f(slot, n));

        self.submit(idx)?;
        out
    }

    pub(crate) fn inflight(&self) -> usize {
        self.ring.inflight()
    }

    pub(crate) fn shutdown(&self) {
        self.ring.shutdown();
    }

    fn submit(&self, idx: usize) -> Result<(), UringError> {
        // SAFETY: callers own `idx`, it is either fresh or just reaped.
        let slot = unsafe { self.slots.get_mut(idx) };

        // SAFETY: the slot lives in the arena until the pool is released, and
        // release drains the ring first.
        unsafe {
            match self.kind {
                ReadKind::RecvMsg(family) => self.ring.submit_recv(idx, slot.prep_recv(family)),
                ReadKind::Readv => self.ring.submit_read(idx, slot.prep_read()),
            }
        }
    }
}

impl Drop for ReadPool {
    fn drop(&mut self) {
        release(&self.ring, &mut self.slots, self.teardown_timeout);
    }
}

/// Write-side requests: a free-list of idle slots in front of one ring.
///
/// A write copies its payload into a free slot, submits it and returns
/// without waiting for the kernel. Slots find their way back to the
/// free-list through completions, reaped either opportunistically after each
/// submit or by a writer that found the free-list empty. With every slot in
/// flight a writer blocks on the completion queue, which bounds the memory a
/// fast producer can pin behind a slow device to `depth * buf_size`.
///
/// A slot is pushed back only while the completion queue lock is held. An
/// acquirer that takes that lock and still sees an empty list knows the next
/// completion is one it is allowed to wait for.
///
/// # Examples
///
/// ```ignore
/// let ring = Ring::try_new(fd, 8, None)?;
/// let pool = WritePool::new(ring, 2048, Duration::from_millis(500));
///
/// // Queued, not written: the call returns once the kernel has the request.
/// pool.submit(WriteKind::Writev, b"packet")?;
/// assert!(pool.available() >= 7);
/// ```
pub(crate) struct WritePool {
    ring: Ring,
    slots: ManuallyDrop<SlotArena>,
    free: ArrayQueue<usize>,
    buf_size: usize,
    teardown_timeout: Duration,
}

impl WritePool {
    pub(crate) fn new(ring: Ring, buf_size: usize, teardown_timeout: Duration) -> Self {
        let slots = SlotArena::new(ring.depth(), buf_size);
        let free = ArrayQueue::new(slots.len());
        for idx in 0..slots.len() {
            // Sized to hold every index, cannot fail.
            let _ = free.push(idx);
        }

        Self {
            ring,
            slots: ManuallyDrop::new(slots),
            free,
            buf_size,
            teardown_timeout,
        }
    }

    /// Copy `data` into a free slot and submit it. Returns once the request
    /// is queued, not when the kernel completes it.
    pub(crate) fn submit(&self, kind: WriteKind<'_>, data: &[u8]) -> Result<(), UringError> {
        // Checked before a slot is taken so a rejected payload never has to
        // hand one back outside the CQ lock.
        if data.len() > self.buf_size {
            return Err(UringError::PayloadTooLarge {
                len: data.len(),
                max: self.buf_size,
            });
        }

        let idx = self.acquire()?;
        self.submit_acquired(idx, kind, data)
    }

    /// Take a slot, blocking on the completion queue when every slot is
    /// busy.
    ///
    /// The completion that wakes the caller hands its slot straight over,
    /// skipping the free-list. A failed write reaped here is reported to the
    /// caller, whose own payload was never queued, after its slot is
    /// returned. Returns [`UringError::Closed`] once the pool is shut down.
    pub(crate) fn acquire(&self) -> Result<usize, UringError> {
        if let Some(idx) = self.free.pop() {
            return Ok(idx);
        }

        // Slots only return to the free-list while the CQ is held, so once we
        // own it an empty free-list means every slot is in flight or about to
        // be, and waiting cannot miss a wakeup.
        let cq = self.ring.completions();
        if let Some(idx) = self.free.pop() {
            return Ok(idx);
        }

        loop {
            let completion = match cq.wait()? {
                Reaped::Slot(c) => c,
                Reaped::Wakeup if self.ring.is_closing() => return Err(UringError::Closed),
                Reaped::Wakeup => continue,
            };

            let idx = self.slots.index(completion.user_data())?;
            if self.ring.is_closing() {
                self.release_slot(idx);
                return Err(UringError::Closed);
            }

            return match completion.bytes() {
                Ok(_) => Ok(idx),
                // Someone else's write, lost with the thread that queued it.
                Err(_) if completion.is_cancelled() => {
                    tracing::warn!(idx, "queued write cancelled by the kernel");
                    Ok(idx)
                }
                Err(e) => {
                    self.release_slot(idx);
                    Err(UringError::Completion(e))
                }
            };
        }
    }

    /// Fill slot `idx` and submit it. The slot goes back to the free-list if
    /// anything fails before the kernel owns it.
    pub(crate) fn submit_acquired(
        &self,
        idx: usize,
        kind: WriteKind<'_>,
        data: &[u8],
    ) -> Result<(), UringError> {
        let mut guard = ScopeGuard::new(|| self.release_slot(idx));
        if self.ring.is_closing() {
            return Err(UringError::Closed);
        }

        // SAFETY: `idx` was acquired, no one else can reach it until submitted.
        let slot = unsafe { self.slots.get_mut(idx) };

        // SAFETY: same lifetime argument as `ReadPool::submit`.
        let res = match kind {
            WriteKind::SendMsg(dest) => {
                let msg = slot.prep_send(data, dest)?;
                unsafe { self.ring.submit_send(idx, msg) }
            }
            WriteKind::Writev => {
                let iov = slot.prep_write(data)?;
                unsafe { self.ring.submit_write(idx, iov) }
            }
        };

        match res {
            Ok(()) => guard.disarm(),
            // Queued anyway, its completion hands the slot back.
            Err(e @ UringError::Submit(_)) => {
                guard.disarm();
                return Err(e);
            }
            Err(e) => return Err(e),
        }

        self.reclaim();
        Ok(())
    }

    /// Best effort: return one finished slot to the free-list without
    /// blocking. Skipped when another thread holds the completion queue,
    /// since that thread is reaping anyway.
    fn reclaim(&self) {
        let Some(cq) = self.ring.try_completions() else {
            return;
        };

        if let Some(Reaped::Slot(c)) = cq.peek() {
            if let Ok(idx) = self.slots.index(c.user_data()) {
                if let Err(e) = c.bytes() {
                    tracing::warn!(idx, error = %e, "write completed with error");
                }
                self.release_slot(idx);
            }
        }
    }

    fn release_slot(&self, idx: usize) {
        if self.free.push(idx).is_err() {
            tracing::error!(idx, "free-list overflow, slot returned twice");
        }
    }

    #[cfg(test)]
    pub(crate) fn is_sqpoll(&self) -> bool {
        self.ring.is_sqpoll()
    }

    pub(crate) fn available(&self) -> usize {
        self.free.len()
    }

    pub(crate) fn shutdown(&self) {
        self.ring.shutdown();
    }
}

impl Drop for WritePool {
    fn drop(&mut self) {
        release(&self.ring, &mut self.slots, self.teardown_timeout);
    }
}

// Slot memory may only be freed once the kernel stopped referencing it. If
// requests are still outstanding after the drain, leak the buffers.
fn release(ring: &Ring, slots: &mut ManuallyDrop<SlotArena>, timeout: Duration) {
    let remaining = ring.drain(timeout);
    if remaining == 0 {
        // SAFETY: nothing is in flight and `slots` is never used again.
        unsafe { ManuallyDrop::drop(slots) };
    } else {
        tracing::warn!(
            remaining,
            "requests still in flight after teardown, leaking slot buffers"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use anyhow::Result;
    use std::fs::File;
    use std::io::Read;
    use std::os::fd::AsRawFd;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    const TIMEOUT: Duration = Duration::from_millis(500);

    fn write_pool(file: &File, depth: usize) -> Result<WritePool> {
        let ring = Ring::try_new(file.as_raw_fd(), depth, None)?;
        Ok(WritePool::new(ring, 64, TIMEOUT))
    }

    #[test]
    fn test_write_pool_starts_full() -> Result<()> {
        require_uring!();
        let null = devnull()?;
        let pool = write_pool(&null, 8)?;

        assert_eq!(pool.available(), 8);
        Ok(())
    }

    #[test]
    fn test_acquire_is_exclusive() -> Result<()> {
        require_uring!();
        let null = devnull()?;
        let pool = write_pool(&null, 4)?;
        let held: Vec<AtomicBool> = (0..4).map(|_| AtomicBool::new(false)).collect();

        thread::scope(|s| {
            for t in 0..8u8 {
                let (pool, held) = (&pool, &held);
                s.spawn(move || {
                    for _ in 0..200 {
                        let idx = pool.acquire().unwrap();
                        assert!(
                            !held[idx].swap(true, Ordering::AcqRel),
                            "slot {idx} handed out twice"
                        );
                        thread::yield_now();
                        held[idx].store(false, Ordering::Release);
                        pool.submit_acquired(idx, WriteKind::Writev, &[t; 16]).unwrap();
                    }
                });
            }
        });

        Ok(())
    }

    #[test]
    fn test_error_completion_returns_slot() -> Result<()> {
        require_uring!();
        // Writing to the read end of a pipe fails with EBADF.
        let (rx, _tx) = pipe()?;
        let pool = write_pool(&rx, 1)?;

        // Acquired from the free-list, the request fails in the kernel.
        pool.submit(WriteKind::Writev, b"lost")?;

        // Either the opportunistic reclaim already recycled the slot, or the
        // next acquisition reaps the error.
        let idx = match pool.acquire() {
            Ok(idx) => idx,
            Err(UringError::Completion(e)) => {
                assert_eq!(e.raw_os_error(), Some(libc::EBADF));
                pool.acquire()?
            }
            Err(e) => return Err(e.into()),
        };
        assert_eq!(idx, 0);
        Ok(())
    }

    #[test]
    fn test_read_pool_resubmits_after_error() -> Result<()> {
        require_uring!();
        // Reading from the write end of a pipe fails with EBADF.
        let (_rx, tx) = pipe()?;
        let ring = Ring::try_new(tx.as_raw_fd(), 1, None)?;
        let pool = ReadPool::new(ring, ReadKind::Readv, 64, TIMEOUT);
        pool.subscribe()?;

        for _ in 0..3 {
            let res = pool.complete(|_, n| Ok(n));
            assert!(matches!(res, Err(UringError::Completion(ref e)) if e.raw_os_error() == Some(libc::EBADF)));
            assert_eq!(pool.inflight(), 1);
        }
        Ok(())
    }

    #[test]
    fn test_read_pool_copies_and_resubmits() -> Result<()> {
        require_uring!();
        let (rx, mut tx) = pipe()?;
        let ring = Ring::try_new(rx.as_raw_fd(), 1, None)?;
        let pool = ReadPool::new(ring, ReadKind::Readv, 64, TIMEOUT);
        pool.subscribe()?;
        assert_eq!(pool.inflight(), 1);

        std::io::Write::write_all(&mut tx, b"ringlink")?;

        let mut buf = [0u8; 64];
        let n = pool.complete(|slot, n| Ok(slot.copy_out(n, &mut buf)))?;
        assert_eq!(&buf[..n], b"ringlink");
        assert_eq!(pool.inflight(), 1);
        Ok(())
    }

    #[test]
    fn test_read_survives_subscriber_thread_exit() -> Result<()> {
        require_uring!();
        let (rx, mut tx) = pipe()?;
        // Without a submission thread the kernel cancels the subscriber's
        // reads when it exits.
        let ring = Ring::try_new(rx.as_raw_fd(), 2, None)?;
        let pool = ReadPool::new(ring, ReadKind::Readv, 64, TIMEOUT);

        thread::scope(|s| s.spawn(|| pool.subscribe()).join().unwrap())?;

        std::io::Write::write_all(&mut tx, b"after exit")?;
        let mut buf = [0u8; 64];
        let n = pool.complete(|slot, n| Ok(slot.copy_out(n, &mut buf)))?;
        assert_eq!(&buf[..n], b"after exit");
        assert_eq!(pool.inflight(), 2);
        Ok(())
    }

    #[test]
    fn test_shutdown_unblocks_reader() -> Result<()> {
        require_uring!();
        let (mut rx, mut tx) = pipe()?;
        let ring = Ring::try_new(rx.as_raw_fd(), 1, None)?;
        let pool = Arc::new(ReadPool::new(ring, ReadKind::Readv, 64, TIMEOUT));
        pool.subscribe()?;

        let reader = {
            let pool = pool.clone();
            thread::spawn(move || pool.complete(|_, n| Ok(n)))
        };

        thread::sleep(Duration::from_millis(50));
        pool.shutdown();

        assert!(matches!(reader.join().unwrap(), Err(UringError::Closed)));
        drop(pool);

        // The pipe is still usable, nothing of ours is left reading from it.
        std::io::Write::write_all(&mut tx, b"x")?;
        let mut one = [0u8; 1];
        rx.read_exact(&mut one)?;
        assert_eq!(&one, b"x");
        Ok(())
    }
}
