/// Runs a closure when it goes out of scope unless disarmed first.
///
/// Acquiring a write slot and submitting it are separate steps, and the
/// payload copy or the push in between can fail. The guard hands the slot
/// back to its free-list on every way out of that window: an error returned
/// with `?`, an explicit early return, or a panic unwinding through the
/// caller. Once the request is in the kernel's hands the caller disarms it.
///
/// The guard is armed on creation.
pub(crate) struct ScopeGuard<F: FnOnce()> {
    // Taken on drop or disarm so the closure runs at most once, even if it
    // panics.
    closure: Option<F>,
}

impl<F: FnOnce()> ScopeGuard<F> {
    /// Creates an armed guard around `closure`.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let free = ArrayQueue::new(1);
    /// let idx = 0;
    /// {
    ///     let _guard = ScopeGuard::new(|| free.push(idx).unwrap());
    ///     assert!(free.is_empty());
    /// } // the slot goes back here
    ///
    /// assert_eq!(free.pop(), Some(0));
    /// ```
    pub(crate) fn new(closure: F) -> Self {
        ScopeGuard {
            closure: Some(closure),
        }
    }

    /// Ownership moved elsewhere, skip the cleanup.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let free = ArrayQueue::new(1);
    /// {
    ///     let mut guard = ScopeGuard::new(|| free.push(0).unwrap());
    ///     // Submitted, the completion hands the slot back instead.
    ///     guard.disarm();
    /// }
    ///
    /// assert!(free.is_empty());
    /// ```
    pub(crate) fn disarm(&mut self) {
        self.closure.take();
    }
}

impl<F: FnOnce()> Drop for ScopeGuard<F> {
    fn drop(&mut self) {
        if let Some(closure) = self.closure.take() {
            closure();
        }
    }
}
