use crate::errors::UringError;
use crate::net::Family;
use crate::net::sockaddr::SockAddrScratch;
use std::cell::UnsafeCell;
use std::net::SocketAddr;

/// A reusable request: payload buffer, scratch peer address and the kernel
/// structures pointing at them.
///
/// The `iovec` and `msghdr` are rebuilt on every `prep_*` call. A slot never
/// moves once it sits in a [`SlotArena`], so the pointers stay valid for as
/// long as the request is in flight.
pub(crate) struct Slot {
    buf: Box<[u8]>,
    addr: SockAddrScratch,
    iov: libc::iovec,
    msg: libc::msghdr,
}

impl Slot {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size].into_boxed_slice(),
            addr: SockAddrScratch::zeroed(),
            iov: libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            },
            // SAFETY: `msghdr` is a plain C struct, all-zero is a valid value.
            msg: unsafe { std::mem::zeroed() },
        }
    }

    pub(crate) fn prep_recv(&mut self, family: Family) -> *mut libc::msghdr {
        self.set_iov(self.buf.len());
        self.set_msg(family.socklen());
        &mut self.msg
    }

    pub(crate) fn prep_send(
        &mut self,
        data: &[u8],
        dest: &SocketAddr,
    ) -> Result<*const libc::msghdr, UringError> {
        let len = self.fill(data)?;
        let namelen = self.addr.encode(dest);
        self.set_iov(len);
        self.set_msg(namelen);
        Ok(&self.msg)
    }

    pub(crate) fn prep_read(&mut self) -> *const libc::iovec {
        self.set_iov(self.buf.len());
        &self.iov
    }

    pub(crate) fn prep_write(&mut self, data: &[u8]) -> Result<*const libc::iovec, UringError> {
        let len = self.fill(data)?;
        self.set_iov(len);
        Ok(&self.iov)
    }

    /// Copies the first `n` received bytes into `dst`, truncating to fit.
    pub(crate) fn copy_out(&self, n: usize, dst: &mut [u8]) -> usize {
        let n = n.min(self.buf.len()).min(dst.len());
        dst[..n].copy_from_slice(&self.buf[..n]);
        n
    }

    /// Peer address of the last `recvmsg` completed on this slot.
    pub(crate) fn source(&self, family: Family) -> Result<SocketAddr, UringError> {
        self.addr.decode(family, self.msg.msg_namelen)
    }

    fn fill(&mut self, data: &[u8]) -> Result<usize, UringError> {
        if data.len() > self.buf.len() {
            return Err(UringError::PayloadTooLarge {
                len: data.len(),
                max: self.buf.len(),
            });
        }
        self.buf[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    fn set_iov(&mut self, len: usize) {
        self.iov = libc::iovec {
            iov_base: self.buf.as_mut_ptr().cast(),
            iov_len: len,
        };
    }

    fn set_msg(&mut self, namelen: libc::socklen_t) {
        // SAFETY: see `Slot::new`.
        self.msg = unsafe { std::mem::zeroed() };
        self.msg.msg_name = self.addr.as_mut_ptr();
        self.msg.msg_namelen = namelen;
        self.msg.msg_iov = &mut self.iov;
        self.msg.msg_iovlen = 1;
    }
}

/// Fixed set of slots addressed by index.
///
/// Ownership of a slot moves between the kernel (in flight), a free-list and
/// the calling thread (being copied). Only the owner may touch it, and the
/// index is the only thing that travels between owners: it is the user data
/// of the submission, it comes back in the completion, and it is what the
/// free-list stores.
///
/// The arena is allocated once and never grows, so a slot's address is
/// stable for the arena's lifetime. That is what lets the kernel hold raw
/// pointers into a slot while the request is in flight. It also means the
/// arena must outlive every request it has handed out; the pools drain their
/// ring before dropping it, and leak it when the drain times out.
///
/// # Examples
///
/// ```ignore
/// let arena = SlotArena::new(8, 2048);
///
/// // Never submitted, so the caller owns slot 0.
/// let iov = unsafe { arena.get_mut(0) }.prep_read();
/// unsafe { ring.submit_read(0, iov) }?;
///
/// // The kernel gives it back through the completion's user data.
/// if let Reaped::Slot(c) = ring.wait()? {
///     let idx = arena.index(c.user_data())?;
///     let n = unsafe { arena.get_mut(idx) }.copy_out(c.bytes()?, &mut buf);
/// }
/// ```
pub(crate) struct SlotArena {
    slots: Box<[UnsafeCell<Slot>]>,
}

// SAFETY: a slot is only ever accessed by its current owner, see above.
unsafe impl Send for SlotArena {}
unsafe impl Sync for SlotArena {}

impl SlotArena {
    /// `depth` slots, each with a zeroed `buf_size` byte buffer.
    pub(crate) fn new(depth: usize, buf_size: usize) -> Self {
        Self {
            slots: (0..depth)
                .map(|_| UnsafeCell::new(Slot::new(buf_size)))
                .collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Validates the user data of a completion before it is used as an index.
    ///
    /// Anything outside `0..len`, including the reserved wakeup token, is a
    /// fatal [`UringError::SlotOutOfRange`]: the kernel only echoes back what
    /// was submitted, so a bad index means the ring state is corrupt.
    pub(crate) fn index(&self, user_data: u64) -> Result<usize, UringError> {
        match usize::try_from(user_data) {
            Ok(idx) if idx < self.slots.len() => Ok(idx),
            _ => {
                let err = UringError::SlotOutOfRange {
                    index: user_data,
                    len: self.slots.len(),
                };
                tracing::error!(error = %err, "completion does not map to a slot");
                Err(err)
            }
        }
    }

    /// # Safety
    ///
    /// The caller must currently own slot `idx`: it was just reaped from the
    /// completion queue, taken from the free-list, or has never been
    /// submitted. `idx` must come from [`SlotArena::index`] or be below
    /// [`SlotArena::len`].
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn get_mut(&self, idx: usize) -> &mut Slot {
        unsafe { &mut *self.slots[idx].get() }
    }
}
