//! A lock-free stack reclaimed with split reference counts.
//!
//! The head pointer carries an external count of the references handed out through it.
//! Each node carries an internal count that collects the difference between references
//! released and references handed out. A popper first bumps the external count of the
//! head it is about to dereference. If it then wins the pop it folds the external count
//! into the internal one, otherwise it releases its single reference. Whoever brings the
//! combined count to zero frees the node.
//!
//! A popper that loses its race releases through the internal count, which would leave its
//! reference in the external count for as long as the node lives. The next popper to
//! acquire the node therefore settles: it moves the released references out of both counts
//! at once, keeping the external count bounded by the poppers currently in flight.
//!
//! No thread registration is involved, so any number of threads may use the stack, at the
//! price of one extra compare-and-swap per pop.

mod ptr;

use self::ptr::{AtomicCountedPtr, CountedPtr, NODE_ALIGN};
use crate::{Backoff, CachePadded};
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::ManuallyDrop;
use core::sync::atomic::{AtomicIsize, Ordering};

#[repr(align(16))]
struct Node<T> {
    value: UnsafeCell<ManuallyDrop<T>>,
    internal: AtomicIsize,
    next: CountedPtr<Node<T>>,
}

/// A lock-free stack whose nodes are freed by reference counting.
///
/// The head packs a node address and its count into one 64-bit word, which requires
/// untagged addresses below 2^48.
pub struct CountedStack<T> {
    head: CachePadded<AtomicCountedPtr<Node<T>>>,
}

impl<T> CountedStack<T> {
    pub fn new() -> Self {
        debug_assert!(core::mem::align_of::<Node<T>>() >= NODE_ALIGN);

        Self {
            head: CachePadded::new(AtomicCountedPtr::new(CountedPtr::null())),
        }
    }

    /// # Panics
    ///
    /// Panics if the allocator hands out an address that cannot be packed next to a count,
    /// as on targets that tag heap pointers in their top byte.
    pub fn push(&self, value: T) {
        let node = Box::new(Node {
            value: UnsafeCell::new(ManuallyDrop::new(value)),
            internal: AtomicIsize::new(0),
            next: CountedPtr::null(),
        });

        assert!(
            CountedPtr::<Node<T>>::fits(&*node),
            "node address {:p} cannot carry a reference count",
            &*node
        );

        let node = Box::into_raw(node);

        let new = CountedPtr::new(node, 1);
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            // Still private to this thread until the exchange succeeds.
            unsafe { (*node).next = head };

            match self
                .head
                .compare_exchange_weak(head, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => {
                    head = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Take one external reference on the current head.
    ///
    /// Returns false without taking anything when the stack is empty. On success `head`
    /// holds the pointer as installed, with the bumped count.
    fn acquire_head(&self, head: &mut CountedPtr<Node<T>>) -> bool {
        loop {
            if head.is_null() {
                return false;
            }

            let acquired = head.acquired();

            match self.head.compare_exchange_weak(
                *head,
                acquired,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    *head = acquired;
                    self.settle(head);
                    return true;
                }
                Err(actual) => *head = actual,
            }
        }
    }

    /// Move references released by losing poppers out of the head's external count.
    ///
    /// The caller holds a reference on `head`, so the node is alive. The internal count is
    /// claimed by swapping it to zero first, so it never turns positive while the node is
    /// linked and no loser can free it early. If the head moved meanwhile the claim is
    /// handed back.
    fn settle(&self, head: &mut CountedPtr<Node<T>>) {
        // one for the list, one for the caller
        if head.count() <= 2 {
            return;
        }

        let internal = unsafe { &(*head.ptr()).internal };
        let observed = internal.load(Ordering::Acquire);

        if observed >= 0
            || internal
                .compare_exchange(observed, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
        {
            return;
        }

        let settled = head.released(observed.unsigned_abs() as u32);

        match self
            .head
            .compare_exchange(*head, settled, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => *head = settled,
            Err(_) => {
                internal.fetch_add(observed, Ordering::AcqRel);
            }
        }
    }

    /// Drop the reference of a popper that lost the race to unlink `node`.
    ///
    /// # Safety
    ///
    /// The caller must hold a reference on `node` acquired through the head.
    unsafe fn release(node: *mut Node<T>) {
        if (*node).internal.fetch_sub(1, Ordering::AcqRel) == 1 {
            drop(Box::from_raw(node));
        }
    }

    pub fn pop(&self) -> Option<T> {
        let backoff = Backoff::new();
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            if !self.acquire_head(&mut head) {
                return None;
            }

            let node = head.ptr();
            // Our external reference keeps the node alive, and `next` never changes once
            // the node is published.
            let next = unsafe { (*node).next };

            match self
                .head
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    let value = unsafe { ManuallyDrop::take(&mut *(*node).value.get()) };

                    // One reference for the list itself, one for this thread.
                    let released = head.count() as isize - 2;
                    if unsafe { (*node).internal.fetch_add(released, Ordering::AcqRel) }
                        == -released
                    {
                        unsafe { drop(Box::from_raw(node)) };
                    }

                    return Some(value);
                }
                Err(actual) => {
                    unsafe { Self::release(node) };
                    head = actual;
                    backoff.spin();
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T> Default for CountedStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for CountedStack<T> {
    fn drop(&mut self) {
        let mut current = self.head.get_mut().ptr();

        while !current.is_null() {
            let mut node = unsafe { Box::from_raw(current) };
            current = node.next.ptr();
            unsafe { ManuallyDrop::drop(node.value.get_mut()) };
        }
    }
}

impl<T> fmt::Debug for CountedStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountedStack")
            .field("head", &self.head.load(Ordering::Relaxed))
            .finish()
    }
}

// Values move between threads, nodes are shared only through the counted head.
unsafe impl<T: Send> Send for CountedStack<T> {}
unsafe impl<T: Send> Sync for CountedStack<T> {}
