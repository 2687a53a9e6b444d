//! Lazy per-manager thread registration.
//!
//! Every manager owns a fixed arena of slots, one per participating thread. A thread claims
//! a slot the first time it touches the manager and keeps it for the manager's lifetime, the
//! index is cached in thread-local storage keyed by the manager's process-unique id. Once the
//! arena is exhausted further threads are refused for good, since slots are never released.
//!
//! A manager dropped on another thread cannot reach this thread's cache, so every entry
//! carries a weak handle to its registry and dead entries are purged whenever a new one is
//! cached.

mod thread_id;

use crate::CachePadded;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

const UNOWNED: usize = usize::MAX;
const CLAIMING: usize = usize::MAX - 1;

/// Cached in place of a slot index once a registry has refused the thread.
const REFUSED: usize = usize::MAX;

static NEXT_REGISTRY_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CLAIMED: RefCell<HashMap<usize, Cached>> = RefCell::new(HashMap::new());
}

/// A cached slot index together with the liveness of the registry it belongs to.
struct Cached {
    index: usize,
    alive: Weak<()>,
}

impl Cached {
    fn is_dead(&self) -> bool {
        self.alive.strong_count() == 0
    }
}

struct Slot<L> {
    owner: AtomicUsize,
    local: L,
}

pub(crate) struct Registry<L> {
    id: usize,
    alive: Arc<()>,
    slots: Box<[CachePadded<Slot<L>>]>,
    claimed: AtomicUsize,
}

impl<L: Default> Registry<L> {
    pub(crate) fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| {
                CachePadded::new(Slot {
                    owner: AtomicUsize::new(UNOWNED),
                    local: L::default(),
                })
            })
            .collect();

        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            alive: Arc::new(()),
            slots,
            claimed: AtomicUsize::new(0),
        }
    }
}

impl<L> Registry<L> {
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn claimed(&self) -> usize {
        self.claimed.load(Ordering::Relaxed)
    }

    /// Get the slot of the calling thread, claiming one if this is its first visit.
    ///
    /// Returns `None` when every slot is owned by another thread.
    #[inline]
    pub(crate) fn local(&self) -> Option<(usize, &L)> {
        let index = CLAIMED
            .try_with(|claimed| {
                let cached = claimed.borrow().get(&self.id).map(|cached| cached.index);

                match cached {
                    Some(index) => index,
                    None => {
                        let index = self.claim().unwrap_or(REFUSED);
                        let mut claimed = claimed.borrow_mut();
                        claimed.retain(|_, cached| !cached.is_dead());
                        claimed.insert(
                            self.id,
                            Cached {
                                index,
                                alive: Arc::downgrade(&self.alive),
                            },
                        );
                        index
                    }
                }
            })
            .unwrap_or(REFUSED);

        if index == REFUSED {
            None
        } else {
            Some((index, &self.slots[index].local))
        }
    }

    #[cold]
    #[inline(never)]
    fn claim(&self) -> Option<usize> {
        if self.claimed.load(Ordering::Relaxed) < self.slots.len() {
            for (index, slot) in self.slots.iter().enumerate() {
                if slot
                    .owner
                    .compare_exchange(UNOWNED, CLAIMING, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    self.claimed.fetch_add(1, Ordering::Relaxed);
                    let owner = thread_id::current();
                    slot.owner.store(owner, Ordering::Release);
                    tracing::debug!(registry = self.id, slot = index, owner, "claimed slot");
                    return Some(index);
                }
            }
        }

        tracing::warn!(
            registry = self.id,
            capacity = self.slots.len(),
            owner = thread_id::current(),
            "thread registry exhausted, reclamation unavailable to this thread"
        );

        None
    }

    /// Identity of the thread owning a slot, `None` while the slot is free or being claimed.
    #[cfg(test)]
    pub(crate) fn owner(&self, index: usize) -> Option<usize> {
        match self.slots[index].owner.load(Ordering::Acquire) {
            UNOWNED | CLAIMING => None,
            owner => Some(owner),
        }
    }

    /// Iterate over every slot, owned or not.
    ///
    /// Scanners read all of them instead of filtering on the owner, an unowned slot holds
    /// no hazards and a quiescent epoch, and a half-claimed one cannot be skipped safely.
    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &L)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, slot)| (index, &slot.local))
    }

    /// Iterate over every slot with exclusive access, owned or not.
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut L> + '_ {
        self.slots.iter_mut().map(|slot| &mut slot.local)
    }
}

/// Number of registries cached by the calling thread, dead ones included.
#[cfg(test)]
pub(crate) fn cached_entries() -> usize {
    CLAIMED.with(|claimed| claimed.borrow().len())
}

impl<L> Drop for Registry<L> {
    fn drop(&mut self) {
        let id = self.id;
        let _ = CLAIMED.try_with(|claimed| claimed.borrow_mut().remove(&id));
    }
}
