use core::sync::atomic::{AtomicU32, Ordering};

/// The part of an epoch kept in retirement snapshots.
pub(crate) type MaskedEpoch = u16;

const EPOCH_MASK: u32 = MaskedEpoch::MAX as u32;

/// A thread's critical-zone counter.
///
/// Odd values mean the thread is inside a critical zone. Every enter and every exit adds
/// one, so two observations of the same odd value bracket a single zone, modulo wrap-around
/// of the masked representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Epoch {
    data: u32,
}

impl Epoch {
    pub(crate) const ZERO: Self = Self::from_raw(0);

    const fn from_raw(data: u32) -> Self {
        Self { data }
    }

    pub(crate) fn into_raw(self) -> u32 {
        self.data
    }

    pub(crate) fn is_critical(self) -> bool {
        self.data & 1 == 1
    }

    pub(crate) fn next(self) -> Self {
        Self::from_raw(self.data.wrapping_add(1))
    }

    pub(crate) fn masked(self) -> MaskedEpoch {
        (self.data & EPOCH_MASK) as MaskedEpoch
    }
}

pub(crate) struct AtomicEpoch {
    raw: AtomicU32,
}

impl AtomicEpoch {
    pub(crate) fn new(epoch: Epoch) -> Self {
        Self {
            raw: AtomicU32::new(epoch.into_raw()),
        }
    }

    pub(crate) fn load(&self, order: Ordering) -> Epoch {
        Epoch::from_raw(self.raw.load(order))
    }

    pub(crate) fn store(&self, epoch: Epoch, order: Ordering) {
        self.raw.store(epoch.into_raw(), order);
    }
}

impl Default for AtomicEpoch {
    fn default() -> Self {
        Self::new(Epoch::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::{AtomicEpoch, Epoch};
    use std::sync::atomic::Ordering;

    #[test]
    fn parity_alternates() {
        let mut epoch = Epoch::ZERO;
        assert!(!epoch.is_critical());

        for step in 1..=6 {
            epoch = epoch.next();
            assert_eq!(epoch.is_critical(), step % 2 == 1);
        }
    }

    #[test]
    fn masked_wraps_at_sixteen_bits() {
        let epoch = Epoch::from_raw(0x0001_0003);
        assert_eq!(epoch.masked(), 3);
        assert!(epoch.is_critical());
        assert_eq!(Epoch::from_raw(u32::MAX).next(), Epoch::ZERO);
    }

    #[test]
    fn atomic_round_trip() {
        let atomic = AtomicEpoch::default();
        let next = atomic.load(Ordering::Relaxed).next();
        atomic.store(next, Ordering::SeqCst);
        assert!(atomic.load(Ordering::SeqCst).is_critical());
    }
}
