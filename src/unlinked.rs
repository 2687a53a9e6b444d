use core::ptr::NonNull;

/// A container node that has been unlinked and handed to a quiescent-state manager.
///
/// Dropping it frees the node's allocation without touching its payload, which the thread
/// that unlinked it has already moved out.
pub(crate) struct Unlinked<N> {
    node: NonNull<N>,
}

impl<N> Unlinked<N> {
    /// # Safety
    ///
    /// `node` must come from `Box::into_raw` and no longer be reachable from the container.
    pub(crate) unsafe fn new(node: *mut N) -> Self {
        Self {
            node: NonNull::new_unchecked(node),
        }
    }
}

impl<N> Drop for Unlinked<N> {
    fn drop(&mut self) {
        unsafe {
            drop(Box::from_raw(self.node.as_ptr()));
        }
    }
}

unsafe impl<N: Send> Send for Unlinked<N> {}
