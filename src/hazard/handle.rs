use super::{HazardLocal, HazardPointers};
use crate::barrier::light_barrier;
use core::fmt;
use core::mem;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};
use std::marker::PhantomData;

/// A registered thread's access to its hazard cells and retired list.
///
/// Obtained from [`HazardPointers::handle`], which performs registration once. Holding a
/// handle proves the thread owns a slot, so none of its operations can be refused. The
/// handle is bound to the thread that created it.
pub struct HazardHandle<'a, T, const SLOTS: usize> {
    manager: &'a HazardPointers<T, SLOTS>,
    local: &'a HazardLocal<T, SLOTS>,
    _marker: PhantomData<*mut ()>,
}

impl<'a, T, const SLOTS: usize> HazardHandle<'a, T, SLOTS> {
    pub(super) fn new(
        manager: &'a HazardPointers<T, SLOTS>,
        local: &'a HazardLocal<T, SLOTS>,
    ) -> Self {
        Self {
            manager,
            local,
            _marker: PhantomData,
        }
    }

    /// Announce `ptr` in cell `index`. The announcement is ordered before any later load.
    #[inline]
    pub fn set(&self, index: usize, ptr: *const T) {
        self.local.cells[index].store(ptr as *mut T, Ordering::SeqCst);
        light_barrier();
    }

    #[inline]
    pub fn unset(&self, index: usize) {
        self.local.cells[index].store(ptr::null_mut(), Ordering::Release);
    }

    /// Whether any of this thread's cells announces `ptr`.
    pub fn contains(&self, ptr: *const T) -> bool {
        self.local
            .cells
            .iter()
            .any(|cell| cell.load(Ordering::Relaxed) == ptr as *mut T)
    }

    /// Announce the current value of `source` in cell `index`.
    ///
    /// The announcement is re-validated against `source` until both agree, at which point
    /// the returned pointer cannot be freed before the cell is cleared or overwritten.
    #[inline]
    pub fn protect(&self, index: usize, source: &AtomicPtr<T>) -> *mut T {
        let mut ptr = source.load(Ordering::Relaxed);

        loop {
            self.set(index, ptr);
            let current = source.load(Ordering::SeqCst);

            if current == ptr {
                return ptr;
            }

            ptr = current;
        }
    }

    /// # Safety
    ///
    /// See [`HazardPointers::retire`].
    pub unsafe fn retire(&self, ptr: *mut T) {
        debug_assert!(!ptr.is_null());
        (*self.local.retired.get()).push(ptr);
    }

    pub fn retired_count(&self) -> usize {
        unsafe { (*self.local.retired.get()).len() }
    }

    /// Run a reclamation pass over this thread's retired list, returning how many were freed.
    pub fn reclaim(&self) -> usize {
        let retired = unsafe { &mut *self.local.retired.get() };

        if retired.is_empty() {
            return 0;
        }

        let hazards = self.manager.hazards();
        let (kept, free): (Vec<_>, Vec<_>) = mem::take(retired)
            .into_iter()
            .partition(|ptr| hazards.binary_search(ptr).is_ok());

        *retired = kept;
        let kept = retired.len();

        // Destructors run after the list is restored, they may retire into it again.
        let freed = free.len();
        for ptr in free {
            unsafe {
                drop(Box::from_raw(ptr));
            }
        }

        tracing::trace!(freed, kept, "hazard pointer reclamation pass");
        freed
    }
}

impl<T, const SLOTS: usize> fmt::Debug for HazardHandle<'_, T, SLOTS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardHandle")
            .field("retired", &self.retired_count())
            .finish()
    }
}
