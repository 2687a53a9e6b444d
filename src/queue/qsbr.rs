use super::Node;
use crate::error::refused;
use crate::unlinked::Unlinked;
use crate::{Backoff, CachePadded, Qsbr, Result, DEFAULT_THREADS};
use core::fmt;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A lock-free FIFO queue whose nodes are reclaimed with quiescent-state-based reclamation.
///
/// Both enqueue and dequeue run inside a critical zone, the dequeuer retires the old
/// sentinel before leaving it.
pub struct QsbrQueue<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    tail: CachePadded<AtomicPtr<Node<T>>>,
    qsbr: Qsbr<Unlinked<Node<T>>>,
}

impl<T> QsbrQueue<T> {
    /// Create a queue usable from up to [`DEFAULT_THREADS`] threads.
    pub fn new() -> Self {
        Self::with_threads(DEFAULT_THREADS)
    }

    /// Create a queue usable from up to `threads` threads.
    ///
    /// # Panics
    ///
    /// Panics if `threads` exceeds `u16::MAX`.
    pub fn with_threads(threads: usize) -> Self {
        let sentinel = Node::sentinel();

        Self {
            head: CachePadded::new(AtomicPtr::new(sentinel)),
            tail: CachePadded::new(AtomicPtr::new(sentinel)),
            qsbr: Qsbr::new(threads),
        }
    }

    pub fn threads(&self) -> usize {
        self.qsbr.threads()
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
    /// with the queue's manager. The value is dropped on failure.
    pub fn try_enqueue(&self, value: T) -> Result<()> {
        let _guard = self.qsbr.guard()?;
        let node = Node::alloc(value);
        let backoff = Backoff::new();

        loop {
            let tail = self.tail.load(Ordering::SeqCst);
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
                return Ok(());
            }

            backoff.spin();
        }
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
    /// with the queue's manager.
    pub fn try_dequeue(&self) -> Result<Option<T>> {
        let guard = self.qsbr.guard()?;
        let backoff = Backoff::new();

        let (head, next) = loop {
            let head = self.head.load(Ordering::SeqCst);
            let next = unsafe { (*head).next.load(Ordering::Acquire) };

            if next.is_null() {
                return Ok(None);
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
        guard.retire(unsafe { Unlinked::new(head) });
        drop(guard);

        if self.qsbr.retired_count_local() >= self.qsbr.reclaim_threshold() {
            let _ = self.qsbr.reclaim_local();
        }

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
    /// thread cannot be registered with the queue's manager.
    pub fn try_is_empty(&self) -> Result<bool> {
        let _guard = self.qsbr.guard()?;
        let head = self.head.load(Ordering::SeqCst);
        Ok(unsafe { (*head).next.load(Ordering::Acquire).is_null() })
    }
}

impl<T> Default for QsbrQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for QsbrQueue<T> {
    fn drop(&mut self) {
        unsafe { super::drain(*self.head.get_mut()) };
    }
}

impl<T> fmt::Debug for QsbrQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QsbrQueue")
            .field("qsbr", &self.qsbr)
            .finish_non_exhaustive()
    }
}
