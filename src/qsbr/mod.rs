//! Quiescent-state-based reclamation.
//!
//! Every registered thread owns an epoch counter that is odd while the thread is inside a
//! critical zone, the only place where it may dereference shared nodes. Retiring a value
//! records which threads were inside a zone at that moment and in which zone. The value
//! is reclaimed once each of those threads has been observed with a different epoch, that
//! is, once every zone that might have seen the value has ended.
//!
//! Quiescent threads cost nothing to a reclaimer, and a thread that never enters a zone
//! never delays anyone. A thread that stays inside a zone forever delays every retirement
//! made while it was there.

mod epoch;
mod guard;
mod retired;

pub use guard::CriticalGuard;

use self::epoch::AtomicEpoch;
use self::retired::{CriticalSnapshot, FullSnapshot, Retired};
use crate::barrier::{light_barrier, strong_barrier};
use crate::registry::Registry;
use crate::{Deleter, DropDeleter, Error, Result};
use core::cell::UnsafeCell;
use core::fmt;
use core::mem;
use core::sync::atomic::Ordering;

pub(crate) struct QsbrLocal<T> {
    epoch: AtomicEpoch,
    retired: UnsafeCell<Vec<Retired<T>>>,
}

impl<T> Default for QsbrLocal<T> {
    fn default() -> Self {
        Self {
            epoch: AtomicEpoch::default(),
            retired: UnsafeCell::new(Vec::new()),
        }
    }
}

// Only the owning thread writes its epoch and touches its retired list, through a `!Send`
// guard or the manager's methods, which resolve to the caller's own slot.
unsafe impl<T: Send> Send for QsbrLocal<T> {}
unsafe impl<T: Send> Sync for QsbrLocal<T> {}

impl<T> QsbrLocal<T> {
    fn enter(&self) -> Result<()> {
        let current = self.epoch.load(Ordering::Relaxed);

        if current.is_critical() {
            return Err(Error::AlreadyCritical);
        }

        self.epoch.store(current.next(), Ordering::SeqCst);
        light_barrier();
        Ok(())
    }

    fn exit(&self) -> Result<()> {
        let current = self.epoch.load(Ordering::Relaxed);

        if !current.is_critical() {
            return Err(Error::NotCritical);
        }

        self.epoch.store(current.next(), Ordering::Release);
        Ok(())
    }

    fn is_critical(&self) -> bool {
        self.epoch.load(Ordering::Relaxed).is_critical()
    }

    fn retired_count(&self) -> usize {
        unsafe { (*self.retired.get()).len() }
    }
}

/// A quiescent-state-based reclamation manager for values of type `T`.
///
/// Values handed to [`retire`](Self::retire) are passed to the deleter `D` once no thread
/// can still be reading them. The manager serves at most `threads` threads, at most
/// `u16::MAX`, further threads are refused with [`Error::Unregistered`].
pub struct Qsbr<T, D: Deleter<T> = DropDeleter> {
    registry: Registry<QsbrLocal<T>>,
    deleter: D,
}

impl<T> Qsbr<T> {
    /// Create a manager that drops reclaimed values.
    ///
    /// # Panics
    ///
    /// Panics if `threads` exceeds `u16::MAX`.
    pub fn new(threads: usize) -> Self {
        Self::with_deleter(threads, DropDeleter)
    }
}

impl<T, D: Deleter<T>> Qsbr<T, D> {
    /// Create a manager that hands reclaimed values to `deleter`.
    ///
    /// # Panics
    ///
    /// Panics if `threads` exceeds `u16::MAX`.
    pub fn with_deleter(threads: usize, deleter: D) -> Self {
        assert!(
            threads <= u16::MAX as usize,
            "a quiescent-state manager serves at most {} threads",
            u16::MAX
        );

        Self {
            registry: Registry::new(threads),
            deleter,
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

    /// Length of a thread's retired list past which the containers run a reclamation pass.
    pub fn reclaim_threshold(&self) -> usize {
        2 * self.registry.capacity()
    }

    fn local(&self) -> Result<&QsbrLocal<T>> {
        self.registry
            .local()
            .map(|(_, local)| local)
            .ok_or(Error::Unregistered)
    }

    /// Register the calling thread without entering a zone.
    pub fn register(&self) -> Result<()> {
        self.local().map(|_| ())
    }

    /// Enter a critical zone.
    ///
    /// Fails with [`Error::AlreadyCritical`] when the thread is already inside one, leaving
    /// its state untouched.
    pub fn enter_critical_zone(&self) -> Result<()> {
        self.local()?.enter()
    }

    /// Exit the current critical zone.
    ///
    /// Fails with [`Error::NotCritical`] when the thread is not inside one, leaving its
    /// state untouched.
    pub fn exit_critical_zone(&self) -> Result<()> {
        self.local()?.exit()
    }

    /// Enter a critical zone for the lifetime of the returned guard.
    pub fn guard(&self) -> Result<CriticalGuard<'_, T, D>> {
        CriticalGuard::enter(self, self.local()?)
    }

    /// Whether the calling thread is inside a critical zone. False when unregistered.
    pub fn is_critical(&self) -> bool {
        self.local()
            .map(|local| local.is_critical())
            .unwrap_or(false)
    }

    /// Retire a value that has been unlinked from every shared location.
    ///
    /// Meant to be called from inside the critical zone in which the value was unlinked.
    /// When the thread is refused a slot the value is leaked and `Unregistered` returned.
    pub fn retire(&self, value: T) -> Result<()> {
        match self.local() {
            Ok(local) => {
                if !local.is_critical() {
                    tracing::debug!("value retired outside of a critical zone");
                }

                self.retire_in(local, value);
                Ok(())
            }
            Err(error) => {
                mem::forget(value);
                Err(error)
            }
        }
    }

    fn retire_in(&self, local: &QsbrLocal<T>, value: T) {
        let critical = self.snapshot_critical();
        unsafe { (*local.retired.get()).push(Retired::new(value, critical)) };
    }

    /// Length of the calling thread's retired list, zero if the thread is unregistered.
    pub fn retired_count_local(&self) -> usize {
        self.local()
            .map(|local| local.retired_count())
            .unwrap_or(0)
    }

    /// Hand every expired value on the calling thread's retired list to the deleter.
    ///
    /// Returns the number of values reclaimed.
    pub fn reclaim_local(&self) -> Result<usize> {
        let local = self.local()?;
        let retired = unsafe { &mut *local.retired.get() };

        if retired.is_empty() {
            return Ok(0);
        }

        let latest = self.snapshot_full();
        let (expired, kept): (Vec<_>, Vec<_>) = mem::take(retired)
            .into_iter()
            .partition(|node| node.is_expired(&latest));

        *retired = kept;
        let kept = retired.len();

        // The deleter runs after the list is restored, it may retire into it again.
        let freed = expired.len();
        for node in expired {
            self.deleter.delete(node.into_value());
        }

        tracing::trace!(freed, kept, "quiescent state reclamation pass");
        Ok(freed)
    }

    /// Record every slot currently inside a critical zone.
    fn snapshot_critical(&self) -> CriticalSnapshot {
        strong_barrier();

        self.registry
            .iter()
            .filter_map(|(index, local)| {
                let epoch = local.epoch.load(Ordering::SeqCst);
                epoch
                    .is_critical()
                    .then(|| (index as u16, epoch.masked()))
            })
            .collect()
    }

    fn snapshot_full(&self) -> FullSnapshot {
        self.registry
            .iter()
            .map(|(_, local)| local.epoch.load(Ordering::SeqCst).masked())
            .collect()
    }
}

impl<T, D: Deleter<T>> Drop for Qsbr<T, D> {
    fn drop(&mut self) {
        let deleter = &self.deleter;
        let mut freed = 0;

        for local in self.registry.iter_mut() {
            for node in local.retired.get_mut().drain(..) {
                deleter.delete(node.into_value());
                freed += 1;
            }
        }

        tracing::trace!(freed, "quiescent state manager dropped");
    }
}

impl<T, D: Deleter<T>> fmt::Debug for Qsbr<T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Qsbr")
            .field("threads", &self.threads())
            .field("registered", &self.registered())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::Qsbr;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread;

    #[test]
    fn zone_protocol_errors() {
        let qsbr = Qsbr::<u32>::new(2);

        assert_eq!(qsbr.exit_critical_zone(), Err(Error::NotCritical));
        assert!(!qsbr.is_critical());

        qsbr.enter_critical_zone().unwrap();
        assert!(qsbr.is_critical());
        assert_eq!(qsbr.enter_critical_zone(), Err(Error::AlreadyCritical));
        assert!(qsbr.is_critical());

        qsbr.exit_critical_zone().unwrap();
        assert!(!qsbr.is_critical());
        assert_eq!(qsbr.exit_critical_zone(), Err(Error::NotCritical));
    }

    #[test]
    fn guard_enters_and_exits() {
        let qsbr = Qsbr::<u32>::new(1);

        {
            let _guard = qsbr.guard().unwrap();
            assert!(qsbr.is_critical());
            assert_eq!(qsbr.guard().err(), Some(Error::AlreadyCritical));
        }

        assert!(!qsbr.is_critical());
    }

    #[test]
    fn retirement_waits_for_own_zone() {
        let deleted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&deleted);
        let qsbr = Qsbr::<u32, _>::with_deleter(1, move |value: u32| sink.lock().unwrap().push(value));

        let guard = qsbr.guard().unwrap();
        guard.retire(1);
        assert_eq!(qsbr.reclaim_local().unwrap(), 0);
        drop(guard);

        assert_eq!(qsbr.reclaim_local().unwrap(), 1);
        assert_eq!(*deleted.lock().unwrap(), vec![1]);
    }

    #[test]
    fn quiescent_retirement_is_immediate() {
        let drops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&drops);
        let qsbr = Qsbr::<String, _>::with_deleter(2, move |_: String| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        qsbr.retire(String::from("unlinked")).unwrap();
        assert_eq!(qsbr.retired_count_local(), 1);
        assert_eq!(qsbr.reclaim_local().unwrap(), 1);
        assert_eq!(qsbr.retired_count_local(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn other_threads_zone_blocks_reclamation() {
        let drops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&drops);
        let qsbr = Arc::new(Qsbr::<u64, _>::with_deleter(2, move |_: u64| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let (entered_tx, entered_rx) = mpsc::channel();
        let (leave_tx, leave_rx) = mpsc::channel::<()>();

        let reader = {
            let qsbr = Arc::clone(&qsbr);

            thread::spawn(move || {
                let guard = qsbr.guard().unwrap();
                entered_tx.send(()).unwrap();
                leave_rx.recv().unwrap();
                drop(guard);
            })
        };

        entered_rx.recv().unwrap();
        qsbr.retire(7).unwrap();
        assert_eq!(qsbr.reclaim_local().unwrap(), 0);

        leave_tx.send(()).unwrap();
        reader.join().unwrap();

        assert_eq!(qsbr.reclaim_local().unwrap(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocked_reclamation_is_idempotent() {
        let drops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&drops);
        let qsbr = Arc::new(Qsbr::<u64, _>::with_deleter(2, move |_: u64| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let (entered_tx, entered_rx) = mpsc::channel();
        let (leave_tx, leave_rx) = mpsc::channel::<()>();

        let reader = {
            let qsbr = Arc::clone(&qsbr);

            thread::spawn(move || {
                let guard = qsbr.guard().unwrap();
                entered_tx.send(()).unwrap();
                leave_rx.recv().unwrap();
                drop(guard);
            })
        };

        entered_rx.recv().unwrap();
        qsbr.retire(1).unwrap();
        qsbr.retire(2).unwrap();
        assert_eq!(qsbr.retired_count_local(), 2);

        for _ in 0..5 {
            assert_eq!(qsbr.reclaim_local().unwrap(), 0);
            assert_eq!(qsbr.retired_count_local(), 2);
        }

        assert_eq!(drops.load(Ordering::SeqCst), 0);

        leave_tx.send(()).unwrap();
        reader.join().unwrap();

        assert_eq!(qsbr.reclaim_local().unwrap(), 2);
        assert_eq!(qsbr.retired_count_local(), 0);
        assert_eq!(qsbr.reclaim_local().unwrap(), 0);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn zone_entered_after_retirement_does_not_block() {
        let qsbr = Arc::new(Qsbr::<Box<u8>>::new(2));
        qsbr.retire(Box::new(1)).unwrap();

        let other = Arc::clone(&qsbr);
        let (entered_tx, entered_rx) = mpsc::channel();
        let (leave_tx, leave_rx) = mpsc::channel::<()>();

        let reader = thread::spawn(move || {
            let _guard = other.guard().unwrap();
            entered_tx.send(()).unwrap();
            leave_rx.recv().unwrap();
        });

        entered_rx.recv().unwrap();
        assert_eq!(qsbr.reclaim_local().unwrap(), 1);

        leave_tx.send(()).unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn quiesce_releases_earlier_retirements() {
        let qsbr = Arc::new(Qsbr::<Box<u8>>::new(2));
        let (entered_tx, entered_rx) = mpsc::channel();
        let (quiesce_tx, quiesce_rx) = mpsc::channel::<()>();
        let (quiesced_tx, quiesced_rx) = mpsc::channel();
        let (leave_tx, leave_rx) = mpsc::channel::<()>();

        let reader = {
            let qsbr = Arc::clone(&qsbr);

            thread::spawn(move || {
                let mut guard = qsbr.guard().unwrap();
                entered_tx.send(()).unwrap();
                quiesce_rx.recv().unwrap();
                guard.quiesce();
                quiesced_tx.send(()).unwrap();
                leave_rx.recv().unwrap();
            })
        };

        entered_rx.recv().unwrap();
        qsbr.retire(Box::new(3)).unwrap();
        assert_eq!(qsbr.reclaim_local().unwrap(), 0);

        quiesce_tx.send(()).unwrap();
        quiesced_rx.recv().unwrap();
        assert_eq!(qsbr.reclaim_local().unwrap(), 1);

        leave_tx.send(()).unwrap();
        reader.join().unwrap();
    }

    #[test]
    fn drop_hands_leftovers_to_deleter() {
        let drops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&drops);
        let qsbr = Qsbr::<u8, _>::with_deleter(1, move |_: u8| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let guard = qsbr.guard().unwrap();
        guard.retire(1);
        guard.retire(2);
        drop(guard);

        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(qsbr);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn exhausted_manager_leaks() {
        let drops = Arc::new(AtomicUsize::new(0));

        struct Tracked(Arc<AtomicUsize>);

        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let qsbr = Arc::new(Qsbr::<Tracked>::new(1));
        qsbr.register().unwrap();

        let other = Arc::clone(&qsbr);
        let value = Tracked(Arc::clone(&drops));

        thread::spawn(move || {
            assert_eq!(other.enter_critical_zone(), Err(Error::Unregistered));
            assert_eq!(other.retire(value), Err(Error::Unregistered));
            assert_eq!(other.reclaim_local(), Err(Error::Unregistered));
            assert!(other.guard().is_err());
        })
        .join()
        .unwrap();

        drop(qsbr);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[should_panic]
    fn capacity_is_bounded_by_slot_width() {
        let _ = Qsbr::<u8>::new(u16::MAX as usize + 1);
    }
}
