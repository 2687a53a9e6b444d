//! Treiber stacks.
//!
//! A singly linked list whose head is swung with compare-and-swap. Pushing never reads a
//! shared node, so only popping needs protection from a reclamation manager.

mod hazard;
mod qsbr;

pub use self::hazard::HazardStack;
pub use self::qsbr::QsbrStack;

use crate::Backoff;
use core::mem::ManuallyDrop;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

struct Node<T> {
    value: ManuallyDrop<T>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn alloc(value: T) -> *mut Self {
        Box::into_raw(Box::new(Self {
            value: ManuallyDrop::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }

    /// Move the value out, leaving the node an empty shell to be freed later.
    ///
    /// # Safety
    ///
    /// Only the thread that unlinked `node` may call this, and only once.
    unsafe fn take(node: *mut Self) -> T {
        ManuallyDrop::into_inner(ptr::read(ptr::addr_of!((*node).value)))
    }
}

fn push<T>(head: &AtomicPtr<Node<T>>, value: T) {
    let node = Node::alloc(value);
    let backoff = Backoff::new();
    let mut current = head.load(Ordering::Relaxed);

    loop {
        // Still private to this thread until the exchange succeeds.
        unsafe { (*node).next.store(current, Ordering::Relaxed) };

        match head.compare_exchange_weak(current, node, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => {
                current = actual;
                backoff.spin();
            }
        }
    }
}

/// Free every node still linked from `head`, dropping their values.
///
/// # Safety
///
/// The caller must have exclusive access to the whole list.
unsafe fn drain<T>(head: *mut Node<T>) {
    let mut current = head;

    while !current.is_null() {
        let mut node = Box::from_raw(current);
        current = *node.next.get_mut();
        ManuallyDrop::drop(&mut node.value);
    }
}
