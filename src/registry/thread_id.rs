//! Identities recorded as slot owners.
//!
//! Unlike a lookup-table id these are never reused. A slot stays owned after its thread
//! exits, so a recycled id would make two live slots claim the same owner.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Reported by threads whose thread-local storage is already torn down.
pub const ANONYMOUS: usize = usize::MAX - 2;

static NEXT_ID: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static THREAD_ID: usize = NEXT_ID.fetch_add(1, Ordering::Relaxed);
}

#[inline]
pub fn current() -> usize {
    THREAD_ID.try_with(|id| *id).unwrap_or(ANONYMOUS)
}
