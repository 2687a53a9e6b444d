use super::Node;
use crate::error::refused;
use crate::{Backoff, CachePadded, HazardPointers, Result, DEFAULT_THREADS};
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A lock-free stack whose nodes are reclaimed with hazard pointers.
///
/// A popping thread protects the head node with its single hazard cell before reading its
/// successor, so a node can be freed only once no popper is looking at it.
pub struct HazardStack<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    hazards: HazardPointers<Node<T>, 1>,
}

impl<T> HazardStack<T> {
    /// Create a stack usable from up to [`DEFAULT_THREADS`] threads.
    pub fn new() -> Self {
        Self::with_threads(DEFAULT_THREADS)
    }

    /// Create a stack usable from up to `threads` popping threads.
    pub fn with_threads(threads: usize) -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            hazards: HazardPointers::new(threads),
        }
    }

    pub fn threads(&self) -> usize {
        self.hazards.threads()
    }

    pub fn push(&self, value: T) {
        super::push(&self.head, value);
    }

    /// Pop the most recently pushed value.
    ///
    /// # Panics
    ///
    /// Panics if more threads than the stack was built for try to pop.
    pub fn pop(&self) -> Option<T> {
        self.try_pop().unwrap_or_else(|error| refused(error))
    }

    /// Pop the most recently pushed value, failing when the calling thread cannot be
    /// registered with the stack's hazard-pointer manager.
    pub fn try_pop(&self) -> Result<Option<T>> {
        let handle = self.hazards.handle()?;
        let backoff = Backoff::new();

        let node = loop {
            let head = handle.protect(0, &self.head);

            if head.is_null() {
                handle.unset(0);
                return Ok(None);
            }

            let next = unsafe { (*head).next.load(Ordering::Acquire) };

            if self
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break head;
            }

            backoff.spin();
        };

        handle.unset(0);
        let value = unsafe { Node::take(node) };
        unsafe { handle.retire(node) };

        if handle.retired_count() >= self.hazards.reclaim_threshold() {
            handle.reclaim();
        }

        Ok(Some(value))
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for HazardStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for HazardStack<T> {
    fn drop(&mut self) {
        unsafe { super::drain(*self.head.get_mut()) };
    }
}

impl<T> fmt::Debug for HazardStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardStack")
            .field("hazards", &self.hazards)
            .finish_non_exhaustive()
    }
}
