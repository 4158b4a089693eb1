use crate::errors::UringError;
use io_uring::cqueue;
use io_uring::squeue::Entry;
use io_uring::types::{Fd, SubmitArgs, Timespec};
use io_uring::{IoUring, opcode};
use parking_lot::{Mutex, MutexGuard};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

// Kernel ABI value, not re-exported by the `io_uring` crate.
const IORING_ENTER_GETEVENTS: u32 = 1;

/// User data carried by requests that do not belong to a slot (cancellations
/// issued on close). Reaping one of these only wakes the waiter.
pub(crate) const WAKE_TOKEN: u64 = u64::MAX;

/// One completed slot request.
#[derive(Debug)]
pub(crate) struct Completion {
    user_data: u64,
    result: i32,
}

impl Completion {
    pub(crate) fn new(user_data: u64, result: i32) -> Self {
        Self { user_data, result }
    }

    /// Raw slot index as submitted. Bounds are checked by the pool.
    pub(crate) fn user_data(&self) -> u64 {
        self.user_data
    }

    /// The kernel cancelled the request before it did any work. Besides our
    /// own cancellations this happens when the thread that submitted it
    /// exits: armed requests complete with `ECANCELED`, requests blocked in a
    /// kernel worker are interrupted with `EINTR`.
    pub(crate) fn is_cancelled(&self) -> bool {
        matches!(-self.result, libc::ECANCELED | libc::EINTR)
    }

    /// Byte count, or the OS error the kernel reported as `-errno`.
    pub(crate) fn bytes(&self) -> io::Result<usize> {
        if self.result < 0 {
            Err(io::Error::from_raw_os_error(-self.result))
        } else {
            Ok(self.result as usize)
        }
    }
}

/// What came out of the completion queue.
#[derive(Debug)]
pub(crate) enum Reaped {
    Slot(Completion),
    Wakeup,
}

impl From<cqueue::Entry> for Reaped {
    fn from(cqe: cqueue::Entry) -> Self {
        match cqe.user_data() {
            WAKE_TOKEN => Reaped::Wakeup,
            user_data => Reaped::Slot(Completion::new(user_data, cqe.result())),
        }
    }
}

/// A submission/completion queue pair bound to a single descriptor.
///
/// The queues are shared between threads. Producers serialize on `sq_lock`
/// and consumers on `cq_lock`, so a thread blocked waiting for a completion
/// never prevents another thread from submitting.
///
/// Every request carries the index of the slot it was issued for as user
/// data, and `inflight` counts requests the kernel still owns. That count is
/// what makes teardown safe: slot memory may only be freed once it drops to
/// zero, see [`Ring::drain`].
///
/// By default the ring is created with a kernel submission thread
/// (`IORING_SETUP_SQPOLL`). Requests then belong to that thread rather than
/// to whichever thread pushed them, so they survive the submitting thread
/// exiting. Without it the kernel cancels a thread's pending requests when
/// the thread exits.
///
/// # Examples
///
/// ```ignore
/// let ring = Ring::try_new(socket.as_raw_fd(), 8, Some(Duration::from_millis(10)))?;
/// unsafe { ring.submit_recv(0, slot.prep_recv(Family::V4)) }?;
///
/// match ring.wait()? {
///     Reaped::Slot(c) => assert_eq!(c.user_data(), 0),
///     // Only ever seen after `shutdown`.
///     Reaped::Wakeup => assert!(ring.is_closing()),
/// }
/// ```
pub(crate) struct Ring {
    ring: IoUring,
    fd: RawFd,
    depth: usize,
    sq_lock: Mutex<()>,
    cq_lock: Mutex<()>,

    // Pushed but not yet reaped, cancellations included.
    inflight: AtomicUsize,
    closing: AtomicBool,
}

// SAFETY: every access to the shared SQ goes through `sq_lock` and every access
// to the shared CQ goes through `cq_lock`.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    /// Creates a ring for `depth` slots on `fd`.
    ///
    /// The submission queue is sized for every slot plus one cancellation per
    /// slot, the two can be queued at the same time while closing. With
    /// `sqpoll_idle` set, a kernel submission thread is requested and idles
    /// after that long without work. Kernels or sandboxes that refuse it get
    /// a plain ring and a warning.
    pub(crate) fn try_new(
        fd: RawFd,
        depth: usize,
        sqpoll_idle: Option<Duration>,
    ) -> Result<Self, UringError> {
        let entries = depth
            .checked_mul(2)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| UringError::Init(io::Error::from_raw_os_error(libc::EINVAL)))?;

        let ring = match sqpoll_idle {
            Some(idle) => {
                let idle_ms = u32::try_from(idle.as_millis()).unwrap_or(u32::MAX);
                match IoUring::builder().setup_sqpoll(idle_ms).build(entries) {
                    Ok(ring) => ring,
                    Err(e) => {
                        tracing::warn!(
                            fd,
                            error = %e,
                            "IORING_SETUP_SQPOLL refused, requests are tied to the submitting thread"
                        );
                        IoUring::builder().build(entries).map_err(UringError::Init)?
                    }
                }
            }
            None => IoUring::builder().build(entries).map_err(UringError::Init)?,
        };

        if !ring.params().is_feature_nodrop() {
            tracing::warn!("IORING_FEAT_NODROP not supported, completions may be dropped");
        }

        tracing::debug!(
            fd,
            depth,
            sqpoll = ring.params().is_setup_sqpoll(),
            "io_uring initialized"
        );

        Ok(Self {
            ring,
            fd,
            depth,
            sq_lock: Mutex::new(()),
            cq_lock: Mutex::new(()),
            inflight: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
        })
    }

    /// Whether requests are owned by a kernel submission thread.
    pub(crate) fn is_sqpoll(&self) -> bool {
        self.ring.params().is_setup_sqpoll()
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Queue a `recvmsg` for slot `idx`.
    ///
    /// # Safety
    ///
    /// `msg` and everything it points to must stay valid and untouched until
    /// the completion for `idx` is reaped.
    pub(crate) unsafe fn submit_recv(
        &self,
        idx: usize,
        msg: *mut libc::msghdr,
    ) -> Result<(), UringError> {
        self.push(opcode::RecvMsg::new(Fd(self.fd), msg).build(), idx as u64)
    }

    /// Queue a `sendmsg` for slot `idx`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Ring::submit_recv`].
    pub(crate) unsafe fn submit_send(
        &self,
        idx: usize,
        msg: *const libc::msghdr,
    ) -> Result<(), UringError> {
        self.push(opcode::SendMsg::new(Fd(self.fd), msg).build(), idx as u64)
    }

    /// Queue a `readv` at the current file position for slot `idx`.
    ///
    /// # Safety
    ///
    /// `iov` and the buffer it describes must stay valid until the completion
    /// for `idx` is reaped.
    pub(crate) unsafe fn submit_read(
        &self,
        idx: usize,
        iov: *const libc::iovec,
    ) -> Result<(), UringError> {
        let entry = opcode::Readv::new(Fd(self.fd), iov, 1)
            .offset(u64::MAX)
            .build();
        self.push(entry, idx as u64)
    }

    /// Queue a `writev` at the current file position for slot `idx`.
    ///
    /// # Safety
    ///
    /// Same contract as [`Ring::submit_read`].
    pub(crate) unsafe fn submit_write(
        &self,
        idx: usize,
        iov: *const libc::iovec,
    ) -> Result<(), UringError> {
        let entry = opcode::Writev::new(Fd(self.fd), iov, 1)
            .offset(u64::MAX)
            .build();
        self.push(entry, idx as u64)
    }

    fn push(&self, entry: Entry, user_data: u64) -> Result<(), UringError> {
        let entry = entry.user_data(user_data);
        let _sq = self.sq_lock.lock();

        // Count before the kernel can see the entry so a racing reap never
        // underflows.
        self.inflight.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.push_locked(&entry) {
            self.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(e);
        }

        // The entry is in the SQ whatever happens now, the next enter flushes it.
        self.ring.submit().map_err(UringError::Submit)?;
        Ok(())
    }

    // Caller must hold `sq_lock`.
    fn push_locked(&self, entry: &Entry) -> Result<(), UringError> {
        // SAFETY: `sq_lock` makes us the only producer. The queue is synced
        // back to the kernel when the temporary queue drops.
        let res = unsafe { self.ring.submission_shared().push(entry) };
        match res {
            Ok(()) => Ok(()),
            // The submission thread has not caught up yet.
            Err(_) if self.is_sqpoll() => {
                self.ring.submitter().squeue_wait().map_err(UringError::Submit)?;
                unsafe { self.ring.submission_shared().push(entry) }.map_err(UringError::from)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Block until a completion is available. The only blocking primitive.
    pub(crate) fn wait(&self) -> Result<Reaped, UringError> {
        self.completions().wait()
    }

    /// Take exclusive ownership of the completion side. Callers that must
    /// re-check shared state before committing to a wait hold this guard
    /// across both.
    pub(crate) fn completions(&self) -> CompletionGuard<'_> {
        CompletionGuard {
            ring: self,
            _cq: self.cq_lock.lock(),
        }
    }

    /// Like [`Ring::completions`] but gives up instead of blocking. Paired
    /// with [`CompletionGuard::peek`] this never waits, whether nothing is
    /// pending or another thread is consuming completions.
    pub(crate) fn try_completions(&self) -> Option<CompletionGuard<'_>> {
        Some(CompletionGuard {
            ring: self,
            _cq: self.cq_lock.try_lock()?,
        })
    }

    // Caller must hold `cq_lock`.
    fn pop(&self) -> Option<Reaped> {
        // SAFETY: `cq_lock` makes us the only consumer. The head is synced back
        // to the kernel when the temporary queue drops.
        let cqe = unsafe { self.ring.completion_shared() }.next()?;
        self.inflight.fetch_sub(1, Ordering::AcqRel);
        Some(cqe.into())
    }

    /// Mark the ring as closing and ask the kernel to cancel every slot
    /// request. Waiters are woken by the cancellation completions.
    pub(crate) fn shutdown(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            self.cancel_all();
        }
    }

    fn cancel_all(&self) {
        for idx in 0..self.depth {
            let cancel = opcode::AsyncCancel::new(idx as u64).build();
            if let Err(e) = self.push(cancel, WAKE_TOKEN) {
                tracing::warn!(fd = self.fd, idx, error = %e, "failed to cancel request");
            }
        }
    }

    /// Reap completions until nothing is in flight or `timeout` elapses.
    /// Returns the number of requests still owned by the kernel.
    ///
    /// Cancellations are issued again even if [`Ring::shutdown`] already ran,
    /// a slot may have been resubmitted after the first pass.
    pub(crate) fn drain(&self, timeout: Duration) -> usize {
        self.closing.store(true, Ordering::Release);
        self.cancel_all();

        let deadline = Instant::now() + timeout;
        let cq = self.completions();

        while self.inflight() > 0 {
            if cq.peek().is_some() {
                continue;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }

            let ts = Timespec::from(deadline - now);
            let args = SubmitArgs::new().timespec(&ts);
            match self.ring.submitter().submit_with_args(1, &args) {
                Ok(_) => {}
                Err(e) if matches!(e.raw_os_error(), Some(libc::ETIME | libc::EINTR)) => {}
                Err(e) => {
                    tracing::warn!(fd = self.fd, error = %e, "failed to drain io_uring");
                    break;
                }
            }
        }

        self.inflight()
    }
}

/// Exclusive access to a ring's completion queue.
pub(crate) struct CompletionGuard<'a> {
    ring: &'a Ring,
    _cq: MutexGuard<'a, ()>,
}

impl CompletionGuard<'_> {
    pub(crate) fn peek(&self) -> Option<Reaped> {
        self.ring.pop()
    }

    pub(crate) fn wait(&self) -> Result<Reaped, UringError> {
        loop {
            if let Some(reaped) = self.ring.pop() {
                return Ok(reaped);
            }

            // Submission happens on the push path, only ask for events here.
            // SAFETY: no argument pointer is passed.
            let res = unsafe {
                self.ring.ring.submitter().enter::<libc::sigset_t>(
                    0,
                    1,
                    IORING_ENTER_GETEVENTS,
                    None,
                )
            };

            match res {
                Ok(_) => {}
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => {}
                Err(e) => return Err(UringError::Io(e)),
            }
        }
    }
}
