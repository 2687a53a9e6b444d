use super::epoch::MaskedEpoch;
use tinyvec::TinyVec;

/// Inline capacity of a critical-zone snapshot before it spills to the heap.
const INLINE_CRITICAL: usize = 8;

/// Inline capacity of a full epoch snapshot before it spills to the heap.
const INLINE_FULL: usize = 64;

/// Which threads were inside a critical zone at retirement, and which zone.
pub(crate) type CriticalSnapshot = TinyVec<[(u16, MaskedEpoch); INLINE_CRITICAL]>;

/// The current masked epoch of every slot, indexed by slot.
pub(crate) type FullSnapshot = TinyVec<[MaskedEpoch; INLINE_FULL]>;

/// A retired value waiting for every zone it was retired during to end.
pub(crate) struct Retired<T> {
    value: T,
    critical: CriticalSnapshot,
}

impl<T> Retired<T> {
    pub(crate) fn new(value: T, critical: CriticalSnapshot) -> Self {
        Self { value, critical }
    }

    /// Whether every zone recorded at retirement has since ended.
    ///
    /// A slot whose masked epoch is unchanged is assumed to still be in the same zone.
    pub(crate) fn is_expired(&self, latest: &FullSnapshot) -> bool {
        self.critical
            .iter()
            .all(|&(slot, epoch)| latest[slot as usize] != epoch)
    }

    pub(crate) fn into_value(self) -> T {
        self.value
    }
}
