use super::Node;
use crate::error::refused;
use crate::unlinked::Unlinked;
use crate::{Backoff, CachePadded, Qsbr, Result, DEFAULT_THREADS};
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// A lock-free stack whose nodes are reclaimed with quiescent-state-based reclamation.
///
/// Every pop runs inside a critical zone of the stack's manager. The popped node is
/// retired before the zone ends and freed once every zone that overlapped it has ended.
pub struct QsbrStack<T> {
    head: CachePadded<AtomicPtr<Node<T>>>,
    qsbr: Qsbr<Unlinked<Node<T>>>,
}

impl<T> QsbrStack<T> {
    /// Create a stack usable from up to [`DEFAULT_THREADS`] threads.
    pub fn new() -> Self {
        Self::with_threads(DEFAULT_THREADS)
    }

    /// Create a stack usable from up to `threads` popping threads.
    ///
    /// # Panics
    ///
    /// Panics if `threads` exceeds `u16::MAX`.
    pub fn with_threads(threads: usize) -> Self {
        Self {
            head: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            qsbr: Qsbr::new(threads),
        }
    }

    pub fn threads(&self) -> usize {
        self.qsbr.threads()
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
    /// registered with the stack's manager.
    pub fn try_pop(&self) -> Result<Option<T>> {
        let guard = self.qsbr.guard()?;
        let backoff = Backoff::new();

        let node = loop {
            let head = self.head.load(Ordering::SeqCst);

            if head.is_null() {
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

        let value = unsafe { Node::take(node) };
        guard.retire(unsafe { Unlinked::new(node) });
        drop(guard);

        if self.qsbr.retired_count_local() >= self.qsbr.reclaim_threshold() {
            let _ = self.qsbr.reclaim_local();
        }

        Ok(Some(value))
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for QsbrStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for QsbrStack<T> {
    fn drop(&mut self) {
        unsafe { super::drain(*self.head.get_mut()) };
    }
}

impl<T> fmt::Debug for QsbrStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QsbrStack")
            .field("qsbr", &self.qsbr)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::QsbrStack;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn lifo_order() {
        let stack = QsbrStack::with_threads(1);

        stack.push(1);
        stack.push(2);
        stack.push(3);

        assert_eq!(stack.pop(), Some(3));
        assert_eq!(stack.pop(), Some(2));
        assert_eq!(stack.pop(), Some(1));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn pop_on_empty_leaves_zone() {
        let stack = QsbrStack::<u8>::with_threads(1);
        assert_eq!(stack.pop(), None);
        assert!(!stack.qsbr.is_critical());
    }

    #[test]
    fn retired_nodes_are_bounded() {
        let stack = QsbrStack::with_threads(2);
        let threshold = stack.qsbr.reclaim_threshold();

        for round in 0..threshold * 4 {
            stack.push(round);
            assert_eq!(stack.pop(), Some(round));
            assert!(stack.qsbr.retired_count_local() < threshold);
        }
    }

    #[test]
    fn concurrent_pushers_then_poppers() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 10_000;

        let stack = Arc::new(QsbrStack::with_threads(THREADS));
        let barrier = Arc::new(Barrier::new(THREADS));

        let pushers: Vec<_> = (0..THREADS)
            .map(|id| {
                let stack = Arc::clone(&stack);
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..PER_THREAD {
                        stack.push(id * PER_THREAD + i);
                    }
                })
            })
            .collect();

        for pusher in pushers {
            pusher.join().unwrap();
        }

        let poppers: Vec<_> = (0..THREADS)
            .map(|_| {
                let stack = Arc::clone(&stack);
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || {
                    barrier.wait();
                    let mut popped = Vec::new();
                    while let Some(value) = stack.pop() {
                        popped.push(value);
                    }
                    popped
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for popper in poppers {
            for value in popper.join().unwrap() {
                assert!(seen.insert(value), "{} popped twice", value);
            }
        }

        assert_eq!(seen.len(), THREADS * PER_THREAD);
        assert!(stack.is_empty());
    }
}
