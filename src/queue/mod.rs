//! Michael-Scott queues.
//!
//! A singly linked list with a sentinel node at the head. Enqueuers link a node after the
//! tail and swing the tail, any thread that finds the tail lagging helps it along. A
//! dequeuer swings the head to the sentinel's successor, which becomes the new sentinel,
//! and moves the value out of it. The old sentinel is retired.

mod hazard;
mod qsbr;

pub use self::hazard::HazardQueue;
pub use self::qsbr::QsbrQueue;

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    /// Initialized from enqueue until the node is dequeued into the sentinel position.
    value: UnsafeCell<MaybeUninit<T>>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn sentinel() -> *mut Self {
        Box::into_raw(Box::new(Self {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    fn alloc(value: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            value: UnsafeCell::new(MaybeUninit::new(value)),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// # Safety
    ///
    /// Only the thread that swung the head onto `node` may call this, and only once.
    unsafe fn take(node: *mut Self) -> T {
        ptr::read((*node).value.get()).assume_init()
    }
}

/// Free the sentinel and every node after it, dropping the values still queued.
///
/// # Safety
///
/// The caller must have exclusive access to the whole list.
unsafe fn drain<T>(head: *mut Node<T>) {
    let mut sentinel = Box::from_raw(head);
    let mut current = *sentinel.next.get_mut();

    while !current.is_null() {
        let mut node = Box::from_raw(current);
        current = *node.next.get_mut();
        ptr::drop_in_place(node.value.get_mut().as_mut_ptr());
    }

    drop(sentinel);
}

/// Emptiness judged from the head and tail pointers alone, without dereferencing either.
///
/// The tail never falls behind the head, so distinct pointers mean at least one value.
/// Equal pointers may still hide a value whose enqueuer has linked it but not yet swung
/// the tail.
fn ends_meet<T>(head: &AtomicPtr<Node<T>>, tail: &AtomicPtr<Node<T>>) -> bool {
    head.load(Ordering::SeqCst) == tail.load(Ordering::SeqCst)
}
