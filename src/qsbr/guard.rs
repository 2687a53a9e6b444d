use super::{Qsbr, QsbrLocal};
use crate::{Deleter, Error, Result};
use core::fmt;
use std::marker::PhantomData;

/// A scope inside a critical zone.
///
/// Creating the guard enters the calling thread's critical zone and dropping it exits, so
/// shared nodes may be dereferenced exactly while the guard is alive. The guard is bound to
/// the thread that created it.
pub struct CriticalGuard<'a, T, D: Deleter<T>> {
    manager: &'a Qsbr<T, D>,
    local: &'a QsbrLocal<T>,
    _marker: PhantomData<*mut ()>,
}

impl<'a, T, D: Deleter<T>> CriticalGuard<'a, T, D> {
    pub(super) fn enter(manager: &'a Qsbr<T, D>, local: &'a QsbrLocal<T>) -> Result<Self> {
        local.enter()?;

        Ok(Self {
            manager,
            local,
            _marker: PhantomData,
        })
    }

    /// Retire a value that was unlinked inside this zone.
    ///
    /// The guard proves the thread is registered, so this cannot be refused.
    pub fn retire(&self, value: T) {
        self.manager.retire_in(self.local, value);
    }

    /// Leave the zone and immediately enter a new one.
    ///
    /// Long-running loops call this between iterations so that values retired by other
    /// threads do not wait on this one for the whole loop.
    pub fn quiesce(&mut self) {
        if self.local.exit().and_then(|_| self.local.enter()).is_err() {
            unreachable_zone_state();
        }
    }
}

impl<T, D: Deleter<T>> Drop for CriticalGuard<'_, T, D> {
    fn drop(&mut self) {
        if let Err(Error::NotCritical) = self.local.exit() {
            unreachable_zone_state();
        }
    }
}

impl<T, D: Deleter<T>> fmt::Debug for CriticalGuard<'_, T, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CriticalGuard").finish_non_exhaustive()
    }
}

/// Someone exited the zone behind the guard's back with `exit_critical_zone`.
#[cold]
fn unreachable_zone_state() {
    tracing::error!("critical zone exited while a guard was still alive");

    if cfg!(debug_assertions) {
        panic!("critical zone exited while a guard was still alive");
    }
}
