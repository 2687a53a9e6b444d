use thiserror::Error;

/// Failures reported by the reclamation managers.
///
/// None of these are fatal. `Unregistered` means reclamation is unavailable to the calling
/// thread and the caller should fall back to leaking, the other two flag misuse of the
/// critical-zone protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("every thread slot of this manager is already claimed")]
    Unregistered,

    #[error("the calling thread is already inside a critical zone")]
    AlreadyCritical,

    #[error("the calling thread is not inside a critical zone")]
    NotCritical,
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Containers call this when the calling thread is refused by their reclamation manager.
#[cold]
#[inline(never)]
pub(crate) fn refused(error: Error) -> ! {
    panic!(
        "{}, construct the container with a larger thread capacity",
        error
    )
}
