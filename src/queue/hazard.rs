use super::Node;
use crate::error::refused;
use crate::{Backoff, CachePadded, HazardHandle, HazardPointers, Result, DEFAULT_THREADS};
use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

const HEAD: usize = 0;
const NEXT: usize = 1;
const TAIL: usize = 0;

/// A lock-free FIFO queue whose nodes are reclaimed with hazard pointers.
///
/// Each thread uses two hazard cells: a dequeuer protects the sentinel and its successor,
/// an enqueuer protects the tail it links after.
pub struct HazardQueue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    hazards: HazardPointers<Node<T>, 2>,
}

impl<T> HazardQueue<T> {
    /// Create a queue usable from up to [`DEFAULT_THREADS`] threads.
    pub fn new() -> Self {
        Self::with_threads(DEFAULT_THREADS)
    }

    /// Create a queue usable from up to `threads` threads.
    pub fn with_threads(threads: usize) -> Self {
        let sentinel = Node::sentinel();

        Self {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
            hazards: HazardPointers::new(threads),
        }
    }

    pub fn threads(&self) -> usize {
        self.hazards.threads()
    }

    /// Append a value at the tail.
    ///
    /// # Panics
    ///
    /// Panics if more threads than the queue was built for use it.
    pub fn enqueue(&self, value: T) {
        self.try_enqueue(value).unwrap_or_else(|error| refused(error))
    }

    /// Append a value at the tail, failing when the calling thread cannot be registered
    /// with the queue's hazard-pointer manager. The value is dropped on failure.
    pub fn try_enqueue(&self, value: T) -> Result<()> {
        let handle = self.hazards.handle()?;
        let node = Node::alloc(value);
        let backoff = Backoff::new();

        loop {
            let tail = handle.protect(TAIL, &self.tail);
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };

            if !next.is_null() {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::SeqCst, Ordering::Relaxed);
                backoff.snooze();
                continue;
            }

            let linked = unsafe {
                (*tail).next.compare_exchange(
                    next,
                    node,
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                )
            };

            if linked.is_ok() {
                let _ = self
                    .tail
                    .compare_exchange(tail, node, Ordering::SeqCst, Ordering::Relaxed);
                break;
            }

            backoff.spin();
        }

        handle.unset(TAIL);
        Ok(())
    }

    /// Remove the value at the head.
    ///
    /// # Panics
    ///
    /// Panics if more threads than the queue was built for use it.
    pub fn dequeue(&self) -> Option<T> {
        self.try_dequeue().unwrap_or_else(|error| refused(error))
    }

    /// Remove the value at the head, failing when the calling thread cannot be registered
    /// with the queue's hazard-pointer manager.
    pub fn try_dequeue(&self) -> Result<Option<T>> {
        let handle = self.hazards.handle()?;
        let backoff = Backoff::new();

        let (head, next) = loop {
            let head = handle.protect(HEAD, &self.head);
            let next = unsafe { (*head).next.load(Ordering::Acquire) };

            if next.is_null() {
                handle.unset(HEAD);
                return Ok(None);
            }

            // Once head is known unchanged after the announcement, `next` cannot have been
            // retired: that requires the head to move past it first.
            handle.set(NEXT, next);

            if self.head.load(Ordering::SeqCst) != head {
                continue;
            }

            let tail = self.tail.load(Ordering::SeqCst);
            if head == tail {
                let _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::SeqCst, Ordering::Relaxed);
                backoff.snooze();
                continue;
            }

            if self
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break (head, next);
            }

            backoff.spin();
        };

        let value = unsafe { Node::take(next) };
        handle.unset(NEXT);
        handle.unset(HEAD);
        unsafe { handle.retire(head) };
        self.collect(&handle);

        Ok(Some(value))
    }

    /// Whether the queue held no value at the moment of the check.
    ///
    /// A thread that cannot be registered gets an answer from the head and tail pointers
    /// alone, which may miss an enqueue that has not finished swinging the tail.
    pub fn is_empty(&self) -> bool {
        self.try_is_empty()
            .unwrap_or_else(|_| super::ends_meet(&self.head, &self.tail))
    }

    /// Whether the queue held no value at the moment of the check, failing when the calling
    /// thread cannot be registered with the queue's hazard-pointer manager.
    pub fn try_is_empty(&self) -> Result<bool> {
        let handle = self.hazards.handle()?;
        let head = handle.protect(HEAD, &self.head);
        let empty = unsafe { (*head).next.load(Ordering::Acquire).is_null() };
        handle.unset(HEAD);
        Ok(empty)
    }

    fn collect(&self, handle: &HazardHandle<'_, Node<T>, 2>) {
        if handle.retired_count() >= self.hazards.reclaim_threshold() {
            handle.reclaim();
        }
    }
}

impl<T> Default for HazardQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for HazardQueue<T> {
    fn drop(&mut self) {
        unsafe { super::drain(*self.head.get_mut()) };
    }
}

impl<T> fmt::Debug for HazardQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardQueue")
            .field("hazards", &self.hazards)
            .finish_non_exhaustive()
    }
}
