//! Safe memory reclamation for lock-free data structures.
//!
//! Two reclamation managers decide when a node that a lock-free algorithm has unlinked can
//! be freed while other threads may still be reading it:
//!
//! - [`HazardPointers`]: readers announce every node they dereference, a reclaiming thread
//!   frees only what nobody announces.
//! - [`Qsbr`]: readers bracket their accesses with critical zones, a retired node is freed
//!   once every zone that overlapped its retirement has ended.
//!
//! Both serve a bounded number of threads fixed at construction. A thread registers with a
//! manager the first time it calls into it, threads beyond the bound are refused with
//! [`Error::Unregistered`] and must leak rather than free.
//!
//! The containers built on top of them, [`HazardStack`], [`QsbrStack`], [`HazardQueue`] and
//! [`QsbrQueue`], are ready to use. [`CountedStack`] reclaims with split reference counts
//! instead and needs no registration.

mod backoff;
mod barrier;
mod cache_padded;
#[cfg(target_pointer_width = "64")]
mod counted;
mod deleter;
mod error;
mod hazard;
mod qsbr;
mod queue;
mod registry;
mod stack;
mod unlinked;

pub use backoff::Backoff;
pub use cache_padded::CachePadded;
#[cfg(target_pointer_width = "64")]
pub use counted::CountedStack;
pub use deleter::{Deleter, DropDeleter};
pub use error::{Error, Result};
pub use hazard::{HazardHandle, HazardPointers};
pub use qsbr::{CriticalGuard, Qsbr};
pub use queue::{HazardQueue, QsbrQueue};
pub use stack::{HazardStack, QsbrStack};

/// Thread capacity of containers built with `new` or `Default`.
pub const DEFAULT_THREADS: usize = 64;
