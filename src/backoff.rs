// LICENSE NOTICE: The stepping scheme follows the backoff in the crossbeam repository (MIT).

use core::cell::Cell;
use core::hint;

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

/// Exponential backoff for the CAS retry loops of the containers.
///
/// A failed compare-and-swap is the expected contention path and is always retried in
/// place. Spinning a little before retrying keeps a hot head or tail pointer from
/// ping-ponging between cores, it does not bound the number of retries.
pub struct Backoff {
    step: Cell<u32>,
}

impl Backoff {
    pub fn new() -> Self {
        Self { step: Cell::new(0) }
    }

    /// Busy-wait for a number of iterations that doubles on every call until it saturates.
    pub fn spin(&self) {
        let step = self.step.get();

        for _ in 0..1 << step.min(SPIN_LIMIT) {
            hint::spin_loop();
        }

        if step <= SPIN_LIMIT {
            self.step.set(step + 1);
        }
    }

    /// Like `spin`, but hands the core back to the scheduler once spinning stops paying off.
    ///
    /// Used where progress depends on another thread finishing a step, such as swinging a
    /// lagging queue tail.
    pub fn snooze(&self) {
        let step = self.step.get();

        if step <= SPIN_LIMIT {
            for _ in 0..1 << step {
                hint::spin_loop();
            }
        } else {
            std::thread::yield_now();
        }

        if step <= YIELD_LIMIT {
            self.step.set(step + 1);
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
