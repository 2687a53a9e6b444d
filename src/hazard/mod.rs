//! Hazard pointers.
//!
//! Every registered thread owns `SLOTS` hazard cells and a private list of retired objects.
//! A reader announces the object it is about to dereference in one of its cells, a writer
//! that unlinked an object retires it and later frees every retired object that no cell in
//! the process announces.

mod handle;

pub use handle::HazardHandle;

use crate::barrier::strong_barrier;
use crate::registry::Registry;
use crate::{Error, Result};
use core::cell::UnsafeCell;
use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

pub(crate) struct HazardLocal<T, const SLOTS: usize> {
    cells: [AtomicPtr<T>; SLOTS],
    retired: UnsafeCell<Vec<*mut T>>,
}

impl<T, const SLOTS: usize> Default for HazardLocal<T, SLOTS> {
    fn default() -> Self {
        Self {
            cells: [(); SLOTS].map(|_| AtomicPtr::new(ptr::null_mut())),
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

// The cells are atomics. The retired list is only touched by the owning thread through a
// `HazardHandle`, which is `!Send`, or under `&mut` when the manager is dropped.
unsafe impl<T: Send, const SLOTS: usize> Send for HazardLocal<T, SLOTS> {}
unsafe impl<T: Send, const SLOTS: usize> Sync for HazardLocal<T, SLOTS> {}

/// A hazard-pointer manager for objects of type `T` allocated with `Box`.
///
/// The manager serves a bounded number of threads, each of which gets `SLOTS` hazard cells
/// the first time it calls into the manager. Threads past that bound are refused with
/// [`Error::Unregistered`] and must fall back to leaking whatever they would have retired.
///
/// Reclamation is amortized: a thread scans the cells of every other thread only when its
/// own retired list reaches [`reclaim_threshold`](Self::reclaim_threshold), twice the number
/// of cells in the process, so at least half of every scan is freed.
pub struct HazardPointers<T, const SLOTS: usize = 1> {
    registry: Registry<HazardLocal<T, SLOTS>>,
}

impl<T, const SLOTS: usize> HazardPointers<T, SLOTS> {
    /// Create a manager serving at most `threads` threads.
    pub fn new(threads: usize) -> Self {
        Self {
            registry: Registry::new(threads),
        }
    }

    /// The number of threads this manager can serve.
    pub fn threads(&self) -> usize {
        self.registry.capacity()
    }

    /// The number of threads that have registered so far.
    pub fn registered(&self) -> usize {
        self.registry.claimed()
    }

    /// Total number of hazard cells across every thread slot.
    pub fn max_hazards_global(&self) -> usize {
        self.registry.capacity() * SLOTS
    }

    /// Length of a thread's retired list past which it should run a reclamation pass.
    pub fn reclaim_threshold(&self) -> usize {
        2 * self.max_hazards_global()
    }

    /// Get the calling thread's handle, registering the thread on first use.
    pub fn handle(&self) -> Result<HazardHandle<'_, T, SLOTS>> {
        match self.registry.local() {
            Some((_, local)) => Ok(HazardHandle::new(self, local)),
            None => Err(Error::Unregistered),
        }
    }

    /// Register the calling thread without touching any cell.
    pub fn register(&self) -> Result<()> {
        self.handle().map(|_| ())
    }

    /// Announce `ptr` in cell `index` of the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if `index >= SLOTS`.
    pub fn set_hazptr(&self, index: usize, ptr: *const T) -> Result<()> {
        self.handle()?.set(index, ptr);
        Ok(())
    }

    /// Clear cell `index` of the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if `index >= SLOTS`.
    pub fn unset_hazptr(&self, index: usize) -> Result<()> {
        self.handle()?.unset(index);
        Ok(())
    }

    /// Check whether any of the calling thread's own cells announces `ptr`.
    ///
    /// This says nothing about other threads. An unregistered thread announces nothing.
    pub fn check_hazptr(&self, ptr: *const T) -> bool {
        self.handle()
            .map(|handle| handle.contains(ptr))
            .unwrap_or(false)
    }

    /// Load `source` and announce the result in cell `index`, retrying until the announced
    /// value is still the current one.
    ///
    /// # Panics
    ///
    /// Panics if `index >= SLOTS`.
    pub fn protect(&self, index: usize, source: &AtomicPtr<T>) -> Result<*mut T> {
        Ok(self.handle()?.protect(index, source))
    }

    /// Hand an unlinked object over to the calling thread's retired list.
    ///
    /// When the thread is refused a slot, `ptr` is left untouched and the caller owns it.
    ///
    /// # Safety
    ///
    /// `ptr` must come from `Box::into_raw`, must no longer be reachable from any shared
    /// location and must not be retired twice.
    pub unsafe fn retire(&self, ptr: *mut T) -> Result<()> {
        self.handle()?.retire(ptr);
        Ok(())
    }

    /// Length of the calling thread's retired list, zero if the thread is unregistered.
    pub fn retired_count_local(&self) -> usize {
        self.handle()
            .map(|handle| handle.retired_count())
            .unwrap_or(0)
    }

    /// Free every object on the calling thread's retired list that no cell announces.
    ///
    /// Returns the number of objects freed. Announced objects stay on the list.
    pub fn reclaim_local(&self) -> Result<usize> {
        Ok(self.handle()?.reclaim())
    }

    /// Alias of [`reclaim_local`](Self::reclaim_local).
    pub fn delete_no_hazard_local(&self) -> Result<usize> {
        self.reclaim_local()
    }

    /// Collect every non-null pointer announced by any thread, sorted.
    fn hazards(&self) -> Vec<*mut T> {
        strong_barrier();

        let mut hazards: Vec<_> = self
            .registry
            .iter()
            .flat_map(|(_, local)| local.cells.iter())
            .map(|cell| cell.load(Ordering::SeqCst))
            .filter(|ptr| !ptr.is_null())
            .collect();

        hazards.sort_unstable();
        hazards.dedup();
        hazards
    }
}

impl<T, const SLOTS: usize> Drop for HazardPointers<T, SLOTS> {
    fn drop(&mut self) {
        let mut freed = 0;

        for local in self.registry.iter_mut() {
            for ptr in local.retired.get_mut().drain(..) {
                unsafe {
                    drop(Box::from_raw(ptr));
                }

                freed += 1;
            }
        }

        tracing::trace!(freed, "hazard pointer manager dropped");
    }
}

impl<T, const SLOTS: usize> fmt::Debug for HazardPointers<T, SLOTS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HazardPointers")
            .field("threads", &self.threads())
            .field("registered", &self.registered())
            .field("slots", &SLOTS)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::HazardPointers;
    use crate::Error;
    use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;

    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked(drops: &Arc<AtomicUsize>) -> *mut Tracked {
        Box::into_raw(Box::new(Tracked(Arc::clone(drops))))
    }

    #[test]
    fn set_check_unset() {
        let hazards = HazardPointers::<u32, 2>::new(4);
        let object = Box::into_raw(Box::new(7));

        assert!(!hazards.check_hazptr(object));
        hazards.set_hazptr(1, object).unwrap();
        assert!(hazards.check_hazptr(object));
        hazards.unset_hazptr(1).unwrap();
        assert!(!hazards.check_hazptr(object));

        unsafe {
            drop(Box::from_raw(object));
        }
    }

    #[test]
    fn thresholds() {
        let hazards = HazardPointers::<u32, 3>::new(5);
        assert_eq!(hazards.max_hazards_global(), 15);
        assert_eq!(hazards.reclaim_threshold(), 30);
    }

    #[test]
    fn protect_returns_current_value() {
        let hazards = HazardPointers::<u32>::new(1);
        let object = Box::into_raw(Box::new(3));
        let source = AtomicPtr::new(object);

        let protected = hazards.protect(0, &source).unwrap();
        assert_eq!(protected, object);
        assert!(hazards.check_hazptr(object));

        hazards.unset_hazptr(0).unwrap();
        unsafe {
            drop(Box::from_raw(object));
        }
    }

    #[test]
    fn unannounced_objects_are_freed() {
        let drops = Arc::new(AtomicUsize::new(0));
        let hazards = HazardPointers::<Tracked>::new(2);

        for _ in 0..3 {
            unsafe { hazards.retire(tracked(&drops)).unwrap() };
        }

        assert_eq!(hazards.retired_count_local(), 3);
        assert_eq!(hazards.reclaim_local().unwrap(), 3);
        assert_eq!(hazards.retired_count_local(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn own_announcement_keeps_object() {
        let drops = Arc::new(AtomicUsize::new(0));
        let hazards = HazardPointers::<Tracked>::new(1);
        let object = tracked(&drops);

        hazards.set_hazptr(0, object).unwrap();
        unsafe { hazards.retire(object).unwrap() };

        assert_eq!(hazards.delete_no_hazard_local().unwrap(), 0);
        assert_eq!(hazards.retired_count_local(), 1);

        hazards.unset_hazptr(0).unwrap();
        assert_eq!(hazards.delete_no_hazard_local().unwrap(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn foreign_announcement_keeps_object() {
        let drops = Arc::new(AtomicUsize::new(0));
        let hazards = Arc::new(HazardPointers::<Tracked>::new(2));
        let object = tracked(&drops);
        let address = object as usize;

        let (announced_tx, announced_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let reader = {
            let hazards = Arc::clone(&hazards);

            thread::spawn(move || {
                hazards.set_hazptr(0, address as *mut Tracked).unwrap();
                announced_tx.send(()).unwrap();
                release_rx.recv().unwrap();
                hazards.unset_hazptr(0).unwrap();
            })
        };

        announced_rx.recv().unwrap();
        unsafe { hazards.retire(object).unwrap() };
        assert_eq!(hazards.reclaim_local().unwrap(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 0);

        release_tx.send(()).unwrap();
        reader.join().unwrap();

        assert_eq!(hazards.reclaim_local().unwrap(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reclamation_is_idempotent() {
        let drops = Arc::new(AtomicUsize::new(0));
        let hazards = HazardPointers::<Tracked>::new(1);
        let kept = tracked(&drops);

        hazards.set_hazptr(0, kept).unwrap();
        unsafe {
            hazards.retire(kept).unwrap();
            hazards.retire(tracked(&drops)).unwrap();
        }

        assert_eq!(hazards.reclaim_local().unwrap(), 1);
        assert_eq!(hazards.reclaim_local().unwrap(), 0);
        assert_eq!(hazards.reclaim_local().unwrap(), 0);
        assert_eq!(hazards.retired_count_local(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        hazards.unset_hazptr(0).unwrap();
    }

    #[test]
    fn drop_frees_everything_retired() {
        let drops = Arc::new(AtomicUsize::new(0));
        let hazards = Arc::new(HazardPointers::<Tracked>::new(4));

        let workers: Vec<_> = (0..3)
            .map(|_| {
                let hazards = Arc::clone(&hazards);
                let drops = Arc::clone(&drops);

                thread::spawn(move || {
                    let object = tracked(&drops);
                    hazards.set_hazptr(0, object).unwrap();
                    unsafe { hazards.retire(object).unwrap() };
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(hazards);
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausted_manager_refuses_thread() {
        let hazards = Arc::new(HazardPointers::<u64>::new(1));
        hazards.register().unwrap();

        let other = {
            let hazards = Arc::clone(&hazards);

            thread::spawn(move || {
                let object = Box::into_raw(Box::new(1));

                assert_eq!(hazards.set_hazptr(0, object), Err(Error::Unregistered));
                assert_eq!(unsafe { hazards.retire(object) }, Err(Error::Unregistered));
                assert_eq!(hazards.reclaim_local(), Err(Error::Unregistered));
                assert!(!hazards.check_hazptr(object));
                assert_eq!(hazards.retired_count_local(), 0);

                // still ours after the refusal
                unsafe { drop(Box::from_raw(object)) };
            })
        };

        other.join().unwrap();
        assert_eq!(hazards.registered(), 1);
    }
}
