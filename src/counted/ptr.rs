use core::fmt;
use core::ptr;
use core::sync::atomic::{AtomicU64, Ordering};

/// Low address bits that are always zero for a node, see `NODE_ALIGN`.
const ALIGN_BITS: u32 = 4;

/// Alignment every counted node type must have.
pub(crate) const NODE_ALIGN: usize = 1 << ALIGN_BITS;

/// Untagged user-space addresses fit in 48 bits.
const ADDRESS_BITS: u32 = 48 - ALIGN_BITS;
const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;

/// Largest external count a pointer can carry.
pub(crate) const MAX_COUNT: u32 = (1 << (64 - ADDRESS_BITS)) - 1;

/// A node pointer paired with the number of references handed out through it.
///
/// The pointer is stored shifted right by its alignment in the low bits and the count
/// fills the rest, so the pair can be swapped with a single 64-bit compare-and-swap.
pub(crate) struct CountedPtr<N> {
    ptr: *mut N,
    count: u32,
}

impl<N> CountedPtr<N> {
    pub(crate) fn null() -> Self {
        Self::new(ptr::null_mut(), 0)
    }

    pub(crate) fn new(ptr: *mut N, count: u32) -> Self {
        debug_assert!(Self::fits(ptr));
        debug_assert!(count <= MAX_COUNT);
        Self { ptr, count }
    }

    /// Whether `ptr` survives packing.
    ///
    /// Fails for misaligned addresses and for addresses using the top 16 bits, such as
    /// pointers carrying a hardware tag or coming from a 57-bit address space.
    pub(crate) fn fits(ptr: *const N) -> bool {
        let addr = ptr as u64;
        addr % NODE_ALIGN as u64 == 0 && (addr >> ALIGN_BITS) & !ADDRESS_MASK == 0
    }

    pub(crate) fn ptr(self) -> *mut N {
        self.ptr
    }

    pub(crate) fn count(self) -> u32 {
        self.count
    }

    pub(crate) fn is_null(self) -> bool {
        self.ptr.is_null()
    }

    /// The same pointer with one more external reference.
    pub(crate) fn acquired(self) -> Self {
        assert!(
            self.count < MAX_COUNT,
            "too many references taken on one node"
        );

        Self::new(self.ptr, self.count + 1)
    }

    /// The same pointer with `released` fewer external references.
    pub(crate) fn released(self, released: u32) -> Self {
        debug_assert!(released <= self.count);
        Self::new(self.ptr, self.count - released)
    }

    fn into_raw(self) -> u64 {
        (self.ptr as u64 >> ALIGN_BITS) | (self.count as u64) << ADDRESS_BITS
    }

    fn from_raw(raw: u64) -> Self {
        Self {
            ptr: ((raw & ADDRESS_MASK) << ALIGN_BITS) as *mut N,
            count: (raw >> ADDRESS_BITS) as u32,
        }
    }
}

impl<N> Clone for CountedPtr<N> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<N> Copy for CountedPtr<N> {}

impl<N> PartialEq for CountedPtr<N> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr && self.count == other.count
    }
}

impl<N> Eq for CountedPtr<N> {}

impl<N> fmt::Debug for CountedPtr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CountedPtr")
            .field("ptr", &self.ptr)
            .field("count", &self.count)
            .finish()
    }
}

pub(crate) struct AtomicCountedPtr<N> {
    raw: AtomicU64,
    _marker: core::marker::PhantomData<*mut N>,
}

impl<N> AtomicCountedPtr<N> {
    pub(crate) fn new(value: CountedPtr<N>) -> Self {
        Self {
            raw: AtomicU64::new(value.into_raw()),
            _marker: core::marker::PhantomData,
        }
    }

    pub(crate) fn load(&self, order: Ordering) -> CountedPtr<N> {
        CountedPtr::from_raw(self.raw.load(order))
    }

    pub(crate) fn get_mut(&mut self) -> CountedPtr<N> {
        CountedPtr::from_raw(*self.raw.get_mut())
    }

    pub(crate) fn compare_exchange(
        &self,
        current: CountedPtr<N>,
        new: CountedPtr<N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedPtr<N>, CountedPtr<N>> {
        self.raw
            .compare_exchange(current.into_raw(), new.into_raw(), success, failure)
            .map(CountedPtr::from_raw)
            .map_err(CountedPtr::from_raw)
    }

    pub(crate) fn compare_exchange_weak(
        &self,
        current: CountedPtr<N>,
        new: CountedPtr<N>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<CountedPtr<N>, CountedPtr<N>> {
        self.raw
            .compare_exchange_weak(current.into_raw(), new.into_raw(), success, failure)
            .map(CountedPtr::from_raw)
            .map_err(CountedPtr::from_raw)
    }
}

// Only addresses are shared, what they point to is guarded by the reference counts.
unsafe impl<N: Send> Send for AtomicCountedPtr<N> {}
unsafe impl<N: Send> Sync for AtomicCountedPtr<N> {}
